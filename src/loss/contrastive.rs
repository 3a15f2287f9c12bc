//! Margin-based contrastive loss

use super::dict::LossDict;
use crate::arch::ModelOutput;
use crate::data::Batch;
use crate::loss::Loss;
use crate::{Error, Result};
use ndarray::{Array1, Array2};

/// Pairwise contrastive loss over in-batch pairs: positives are pulled
/// together by squared distance, negatives pushed past `margin`.
///
/// During training the batch features are typically extended with the
/// cross-batch memory residents before this loss runs, which is what gives
/// it an effective batch far larger than the device batch.
#[derive(Debug, Clone)]
pub struct ContrastiveLoss {
    name: String,
    margin: f32,
    /// Embedding width the memory bank must match
    feat_dim: usize,
}

impl ContrastiveLoss {
    pub fn new(margin: f32, feat_dim: usize) -> Result<Self> {
        if margin <= 0.0 {
            return Err(Error::config(
                "ContrastiveLoss.margin",
                format!("margin {margin} must be positive"),
            ));
        }
        if feat_dim == 0 {
            return Err(Error::config("ContrastiveLoss.feat_dim", "must be positive"));
        }
        Ok(Self {
            name: "ContrastiveLoss".to_string(),
            margin,
            feat_dim,
        })
    }

    pub fn feat_dim(&self) -> usize {
        self.feat_dim
    }

    pub fn compute(&self, feats: &Array2<f32>, labels: &Array1<i64>) -> Result<LossDict> {
        let n = feats.nrows();
        if n < 2 {
            return Err(Error::DegenerateBatch(
                "contrastive loss needs at least two samples".into(),
            ));
        }
        if labels.len() != n {
            return Err(Error::DegenerateBatch(format!(
                "{n} feature rows but {} labels",
                labels.len()
            )));
        }
        if feats.ncols() != self.feat_dim {
            return Err(Error::DegenerateBatch(format!(
                "feature dim {} does not match configured {}",
                feats.ncols(),
                self.feat_dim
            )));
        }
        let mut total = 0.0;
        let mut pairs = 0usize;
        for i in 0..n {
            for j in (i + 1)..n {
                let d2: f32 = feats
                    .row(i)
                    .iter()
                    .zip(feats.row(j).iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                if labels[i] == labels[j] {
                    total += d2;
                } else {
                    let gap = self.margin - d2.sqrt();
                    if gap > 0.0 {
                        total += gap * gap;
                    }
                }
                pairs += 1;
            }
        }
        Ok(LossDict::single(&self.name, total / pairs as f32))
    }
}

impl Loss for ContrastiveLoss {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, predicts: &ModelOutput, batch: &Batch) -> Result<LossDict> {
        self.compute(predicts.primary()?, &batch.labels)
    }

    fn feat_dim_hint(&self) -> Option<usize> {
        Some(self.feat_dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_clustered_features_score_low() {
        let tight = array![[0.0_f32, 0.0], [0.1, 0.0], [5.0, 5.0], [5.1, 5.0]];
        let labels = array![0_i64, 0, 1, 1];
        let loss = ContrastiveLoss::new(1.0, 2).unwrap();
        let good = loss.compute(&tight, &labels).unwrap().get("ContrastiveLoss").unwrap();

        let mixed = array![[0.0_f32, 0.0], [5.0, 5.0], [0.1, 0.0], [5.1, 5.0]];
        let bad = loss.compute(&mixed, &labels).unwrap().get("ContrastiveLoss").unwrap();
        assert!(good < bad);
    }

    #[test]
    fn test_separated_negatives_cost_nothing() {
        let feats = array![[0.0_f32, 0.0], [10.0, 0.0]];
        let labels = array![0_i64, 1];
        let loss = ContrastiveLoss::new(1.0, 2).unwrap();
        let d = loss.compute(&feats, &labels).unwrap();
        assert_relative_eq!(d.get("ContrastiveLoss").unwrap(), 0.0);
    }

    #[test]
    fn test_single_sample_rejected() {
        let feats = array![[0.0_f32, 0.0]];
        let labels = array![0_i64];
        let loss = ContrastiveLoss::new(1.0, 2).unwrap();
        assert!(loss.compute(&feats, &labels).is_err());
    }
}
