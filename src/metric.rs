//! Evaluation metrics

use crate::config::Config;
use crate::{Error, Result};
use ndarray::{Array1, Array2};

/// Named metric over one batch of logits (or features) and labels. Values
/// accumulate across batches as a plain average.
pub trait Metric {
    fn name(&self) -> &str;

    fn compute(&self, output: &Array2<f32>, labels: &Array1<i64>) -> Result<Vec<(String, f32)>>;

    /// Metrics over raw logits are meaningless after a batch-level transform
    /// (e.g. mixup); such metrics are dropped with a warning.
    fn compatible_with_batch_transform(&self) -> bool {
        false
    }
}

/// Fraction of samples whose label lands in the top-k scores, for each
/// configured k.
pub struct TopkAcc {
    topk: Vec<usize>,
}

impl TopkAcc {
    pub fn new(topk: Vec<usize>) -> Result<Self> {
        if topk.is_empty() || topk.contains(&0) {
            return Err(Error::config(
                "Metric.TopkAcc.topk",
                "needs at least one positive k",
            ));
        }
        Ok(Self { topk })
    }
}

impl Metric for TopkAcc {
    fn name(&self) -> &str {
        "TopkAcc"
    }

    fn compute(&self, output: &Array2<f32>, labels: &Array1<i64>) -> Result<Vec<(String, f32)>> {
        let n = output.nrows();
        if n == 0 || labels.len() != n {
            return Err(Error::DegenerateBatch(format!(
                "{n} output rows but {} labels",
                labels.len()
            )));
        }
        let mut hits = vec![0usize; self.topk.len()];
        for (row, &label) in output.rows().into_iter().zip(labels.iter()) {
            let mut idx: Vec<usize> = (0..row.len()).collect();
            idx.sort_by(|&a, &b| {
                row[b].partial_cmp(&row[a]).unwrap_or(std::cmp::Ordering::Equal)
            });
            for (slot, &k) in self.topk.iter().enumerate() {
                if idx.iter().take(k).any(|&i| i as i64 == label) {
                    hits[slot] += 1;
                }
            }
        }
        Ok(self
            .topk
            .iter()
            .zip(&hits)
            .map(|(&k, &h)| (format!("top{k}"), h as f32 / n as f32))
            .collect())
    }
}

/// Retrieval recall@k: a query scores when any of its k nearest gallery
/// entries (by Euclidean distance) shares its label.
pub fn recall_at_k(
    gallery: &Array2<f32>,
    gallery_labels: &Array1<i64>,
    query: &Array2<f32>,
    query_labels: &Array1<i64>,
    ks: &[usize],
) -> Result<Vec<(String, f32)>> {
    if gallery.nrows() == 0 || query.nrows() == 0 {
        return Err(Error::DegenerateBatch(
            "empty gallery or query set for retrieval".into(),
        ));
    }
    if gallery.ncols() != query.ncols() {
        return Err(Error::DegenerateBatch(format!(
            "gallery dim {} does not match query dim {}",
            gallery.ncols(),
            query.ncols()
        )));
    }
    let mut hits = vec![0usize; ks.len()];
    for (q, &q_label) in query.rows().into_iter().zip(query_labels.iter()) {
        let mut dists: Vec<(f32, i64)> = gallery
            .rows()
            .into_iter()
            .zip(gallery_labels.iter())
            .map(|(g, &gl)| {
                let d: f32 = q.iter().zip(g.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
                (d, gl)
            })
            .collect();
        dists.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        for (slot, &k) in ks.iter().enumerate() {
            if dists.iter().take(k).any(|&(_, gl)| gl == q_label) {
                hits[slot] += 1;
            }
        }
    }
    let n = query.nrows() as f32;
    Ok(ks
        .iter()
        .zip(&hits)
        .map(|(&k, &h)| (format!("recall{k}"), h as f32 / n))
        .collect())
}

/// The k values for the retrieval evaluator, from the section's `Recallk`
/// entry; `[1, 5]` when unset.
pub fn retrieval_topk(config: &Config, section: &str) -> Result<Vec<usize>> {
    let default = vec![1, 5];
    let Some(seq) = config.get(section).and_then(|v| v.as_sequence()) else {
        return Ok(default);
    };
    for item in seq {
        let Some(map) = item.as_mapping() else { continue };
        let Some((_, params)) = map.iter().find(|(k, _)| k.as_str() == Some("Recallk")) else {
            continue;
        };
        let Some(topk) = params
            .as_mapping()
            .and_then(|m| {
                m.iter()
                    .find(|(k, _)| k.as_str() == Some("topk"))
                    .map(|(_, v)| v)
            })
            .and_then(|v| v.as_sequence())
        else {
            continue;
        };
        return topk
            .iter()
            .map(|v| {
                v.as_u64()
                    .filter(|&n| n > 0)
                    .map(|n| n as usize)
                    .ok_or_else(|| {
                        Error::config(
                            format!("{section}.Recallk.topk"),
                            "expected positive integers",
                        )
                    })
            })
            .collect();
    }
    Ok(default)
}

/// Build the metric list from a config section such as `Metric.Eval`.
pub fn build_metrics(config: &Config, section: &str) -> Result<Vec<Box<dyn Metric>>> {
    let Some(value) = config.get(section) else {
        return Ok(Vec::new());
    };
    let seq = value
        .as_sequence()
        .ok_or_else(|| Error::config(section, "metric config should be a list"))?;
    let mut metrics: Vec<Box<dyn Metric>> = Vec::with_capacity(seq.len());
    for item in seq {
        let map = item
            .as_mapping()
            .filter(|m| m.len() == 1)
            .ok_or_else(|| Error::config(section, "each metric entry must have exactly one key"))?;
        let (name, params) = map.iter().next().expect("checked len == 1");
        match name.as_str() {
            Some("TopkAcc") => {
                let topk = match params {
                    serde_yaml::Value::Null => vec![1, 5],
                    serde_yaml::Value::Mapping(m) => m
                        .iter()
                        .find(|(k, _)| k.as_str() == Some("topk"))
                        .and_then(|(_, v)| v.as_sequence())
                        .map(|seq| {
                            seq.iter()
                                .map(|v| {
                                    v.as_u64().map(|n| n as usize).ok_or_else(|| {
                                        Error::config("Metric.TopkAcc.topk", "expected integers")
                                    })
                                })
                                .collect::<Result<Vec<_>>>()
                        })
                        .transpose()?
                        .unwrap_or_else(|| vec![1, 5]),
                    _ => {
                        return Err(Error::config(
                            section,
                            "metric parameters must be a mapping or null",
                        ))
                    }
                };
                metrics.push(Box::new(TopkAcc::new(topk)?));
            }
            // recall is computed over whole gallery/query sets by the
            // retrieval evaluator; its ks are read by `retrieval_topk`
            Some("Recallk") => {}
            Some(other) => {
                return Err(Error::config(section, format!("unknown metric `{other}`")))
            }
            None => return Err(Error::config(section, "metric name must be a string")),
        }
    }
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_topk_acc() {
        let logits = array![
            [0.9_f32, 0.05, 0.05],
            [0.1, 0.2, 0.7],
            [0.4, 0.5, 0.1]
        ];
        let labels = array![0_i64, 2, 0];
        let m = TopkAcc::new(vec![1, 2]).unwrap();
        let vals = m.compute(&logits, &labels).unwrap();
        assert_eq!(vals[0].0, "top1");
        assert_relative_eq!(vals[0].1, 2.0 / 3.0, epsilon = 1e-6);
        assert_relative_eq!(vals[1].1, 1.0);
    }

    #[test]
    fn test_recall_at_k() {
        let gallery = array![[0.0_f32, 0.0], [10.0, 10.0], [0.2, 0.0]];
        let g_labels = array![0_i64, 1, 0];
        let query = array![[0.1_f32, 0.0], [9.9, 10.0]];
        let q_labels = array![0_i64, 1];
        let vals = recall_at_k(&gallery, &g_labels, &query, &q_labels, &[1]).unwrap();
        assert_relative_eq!(vals[0].1, 1.0);
    }

    #[test]
    fn test_retrieval_topk_from_config() {
        let config = Config::from_yaml_str(
            "Metric:\n  Eval:\n    - Recallk:\n        topk: [1, 10]\n",
        )
        .unwrap();
        assert_eq!(retrieval_topk(&config, "Metric.Eval").unwrap(), vec![1, 10]);

        let config = Config::from_yaml_str("Metric: {}\n").unwrap();
        assert_eq!(retrieval_topk(&config, "Metric.Eval").unwrap(), vec![1, 5]);

        let config = Config::from_yaml_str(
            "Metric:\n  Eval:\n    - Recallk:\n        topk: [0]\n",
        )
        .unwrap();
        assert!(retrieval_topk(&config, "Metric.Eval").is_err());
    }

    #[test]
    fn test_build_metrics_registry() {
        let config = Config::from_yaml_str(
            "Metric:\n  Eval:\n    - TopkAcc:\n        topk: [1, 3]\n",
        )
        .unwrap();
        let metrics = build_metrics(&config, "Metric.Eval").unwrap();
        assert_eq!(metrics.len(), 1);

        let config = Config::from_yaml_str("Metric:\n  Eval:\n    - mAP:\n").unwrap();
        assert!(build_metrics(&config, "Metric.Eval").is_err());

        let config = Config::from_yaml_str("Metric: {}\n").unwrap();
        assert!(build_metrics(&config, "Metric.Eval").unwrap().is_empty());
    }
}
