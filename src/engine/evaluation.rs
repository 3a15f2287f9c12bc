//! Evaluation
//!
//! `eval` runs the routine selected by `Global.eval_mode` and returns the
//! headline metric (higher is better). During training it is called as a
//! nested operation; training mode on the model is disabled for the
//! duration and restored afterwards.

use super::train::AverageMeter;
use super::{Engine, EvalMode, Mode};
use crate::metric::{recall_at_k, retrieval_topk};
use crate::{Error, Result};
use ndarray::{Array1, Array2};

enum RetrievalSet {
    Gallery,
    Query,
}

impl Engine {
    /// Evaluate the current weights and return the headline metric.
    ///
    /// Classification averages the per-batch metric values (and the eval
    /// loss when one is configured) over the eval loader; retrieval embeds
    /// the gallery and query sets and scores recall@k. The AdaFace routine
    /// shares the classification path, its differences live entirely in the
    /// data pipeline.
    pub fn eval(&mut self) -> Result<f32> {
        if !matches!(self.mode(), Mode::Train | Mode::Eval) {
            return Err(Error::config(
                "mode",
                format!("eval() requires train or eval mode, engine was built for {:?}", self.mode()),
            ));
        }
        self.model.set_train(false);
        let result = match self.eval_mode {
            EvalMode::Classification | EvalMode::Adaface => self.eval_classification(),
            EvalMode::Retrieval => self.eval_retrieval(),
        };
        self.model.set_train(self.mode() == Mode::Train);
        result
    }

    fn eval_classification(&mut self) -> Result<f32> {
        if self.eval_loader.is_none() {
            return Err(Error::config(
                "DataLoader.Eval",
                "classification evaluation needs an eval loader",
            ));
        }
        if let Some(loader) = self.eval_loader.as_deref_mut() {
            loader.reset();
        }

        let mut loss_meter = AverageMeter::new();
        let mut metric_acc: Vec<(String, AverageMeter)> = Vec::new();
        while let Some(batch) = self.eval_loader.as_deref_mut().and_then(|l| l.next_batch()) {
            let predicts = self.model.forward(&batch.inputs)?;
            if let Some(loss) = &self.eval_loss {
                let terms = loss.forward(&predicts, &batch)?;
                loss_meter.update_n(terms.get("loss").unwrap_or(0.0), batch.len());
            }
            let logits = predicts.primary()?;
            for metric in &self.eval_metrics {
                for (key, value) in metric.compute(logits, &batch.labels)? {
                    match metric_acc.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, meter)) => meter.update_n(value, batch.len()),
                        None => {
                            let mut meter = AverageMeter::new();
                            meter.update_n(value, batch.len());
                            metric_acc.push((key, meter));
                        }
                    }
                }
            }
        }

        if self.eval_loss.is_some() {
            println!("[eval] loss: {:.6}", loss_meter.avg());
        }
        for (key, meter) in &metric_acc {
            println!("[eval] {key}: {:.5}", meter.avg());
        }

        // headline: first configured metric; without metrics, fall back to
        // negated loss so "higher is better" still holds for best tracking
        match metric_acc.first() {
            Some((_, meter)) => Ok(meter.avg()),
            None if self.eval_loss.is_some() => Ok(-loss_meter.avg()),
            None => Ok(0.0),
        }
    }

    fn eval_retrieval(&mut self) -> Result<f32> {
        let (gallery, gallery_labels) = self.collect_features(RetrievalSet::Gallery)?;
        let (query, query_labels) = self.collect_features(RetrievalSet::Query)?;
        let ks = retrieval_topk(&self.config, "Metric.Eval")?;
        let values = recall_at_k(&gallery, &gallery_labels, &query, &query_labels, &ks)?;
        for (key, value) in &values {
            println!("[eval] {key}: {value:.5}");
        }
        Ok(values.first().map(|(_, v)| *v).unwrap_or(0.0))
    }

    /// Embed one retrieval set. The loader is moved out of its slot for the
    /// duration so the model can run while the loader iterates.
    fn collect_features(&mut self, which: RetrievalSet) -> Result<(Array2<f32>, Array1<i64>)> {
        let slot = match which {
            RetrievalSet::Gallery => &mut self.gallery_loader,
            RetrievalSet::Query => &mut self.query_loader,
        };
        let mut loader = slot.take().ok_or_else(|| {
            Error::config(
                "DataLoader",
                "retrieval evaluation needs Gallery and Query loaders",
            )
        })?;
        loader.reset();

        let mut gather = || -> Result<(Array2<f32>, Array1<i64>)> {
            let mut rows: Vec<f32> = Vec::new();
            let mut labels: Vec<i64> = Vec::new();
            let mut dim = 0;
            while let Some(batch) = loader.next_batch() {
                let predicts = self.model.forward(&batch.inputs)?;
                let feats = predicts.primary()?;
                dim = feats.ncols();
                rows.extend(feats.iter().copied());
                labels.extend(batch.labels.iter().copied());
            }
            if labels.is_empty() {
                return Err(Error::DegenerateBatch("empty retrieval set".to_string()));
            }
            let n = labels.len();
            let feats = Array2::from_shape_vec((n, dim), rows)
                .map_err(|e| Error::DegenerateBatch(format!("feature matrix: {e}")))?;
            Ok((feats, Array1::from_vec(labels)))
        };
        let result = gather();

        match which {
            RetrievalSet::Gallery => self.gallery_loader = Some(loader),
            RetrievalSet::Query => self.query_loader = Some(loader),
        }
        result
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::{EngineBuilder, Mode};

    fn eval_config(eval_mode: &str) -> Config {
        Config::from_yaml_str(&format!(
            "Global:\n  epochs: 1\n  seed: 3\n  eval_mode: {eval_mode}\nArch:\n  name: LinearClassifier\n  class_num: 3\n  feat_dim: 6\nMetric:\n  Eval:\n    - TopkAcc:\n        topk: [1, 2]\nDataLoader:\n  Eval:\n    num_samples: 30\n    feat_dim: 6\n    class_num: 3\n    batch_size: 8\n    shuffle: false\n  Gallery:\n    num_samples: 24\n    feat_dim: 6\n    class_num: 3\n    batch_size: 8\n    shuffle: false\n  Query:\n    num_samples: 12\n    feat_dim: 6\n    class_num: 3\n    batch_size: 8\n    shuffle: false\n"
        ))
        .unwrap()
    }

    #[test]
    fn test_classification_headline_in_range() {
        let mut engine = EngineBuilder::new(eval_config("classification"), Mode::Eval)
            .build()
            .unwrap();
        let metric = engine.eval().unwrap();
        assert!((0.0..=1.0).contains(&metric));
    }

    #[test]
    fn test_adaface_shares_classification_path() {
        let mut engine = EngineBuilder::new(eval_config("adaface"), Mode::Eval)
            .build()
            .unwrap();
        assert!(engine.eval().is_ok());
    }

    #[test]
    fn test_retrieval_recall_in_range() {
        let config = Config::from_yaml_str(
            "Global:\n  epochs: 1\n  seed: 3\n  eval_mode: retrieval\nArch:\n  name: LinearClassifier\n  class_num: 3\n  feat_dim: 6\nMetric:\n  Eval:\n    - Recallk:\n        topk: [1]\nDataLoader:\n  Gallery:\n    num_samples: 24\n    feat_dim: 6\n    class_num: 3\n    batch_size: 8\n    shuffle: false\n  Query:\n    num_samples: 12\n    feat_dim: 6\n    class_num: 3\n    batch_size: 8\n    shuffle: false\n",
        )
        .unwrap();
        let mut engine = EngineBuilder::new(config, Mode::Eval).build().unwrap();
        let metric = engine.eval().unwrap();
        assert!((0.0..=1.0).contains(&metric));
    }

    #[test]
    fn test_eval_loss_reported_without_metrics() {
        let config = Config::from_yaml_str(
            "Global:\n  epochs: 1\n  seed: 3\nArch:\n  name: LinearClassifier\n  class_num: 3\n  feat_dim: 6\nLoss:\n  Eval:\n    - CELoss:\nDataLoader:\n  Eval:\n    num_samples: 16\n    feat_dim: 6\n    class_num: 3\n    batch_size: 8\n",
        )
        .unwrap();
        let mut engine = EngineBuilder::new(config, Mode::Eval).build().unwrap();
        // headline falls back to negated loss
        let metric = engine.eval().unwrap();
        assert!(metric <= 0.0);
    }

    #[test]
    fn test_eval_rejected_in_infer_mode() {
        let config = Config::from_yaml_str(
            "Global:\n  epochs: 1\nArch:\n  name: LinearClassifier\n  class_num: 3\n  feat_dim: 6\n",
        )
        .unwrap();
        let mut engine = EngineBuilder::new(config, Mode::Infer).build().unwrap();
        assert!(engine.eval().is_err());
    }
}
