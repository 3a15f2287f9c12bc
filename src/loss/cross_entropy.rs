//! Cross-entropy with optional label smoothing

use super::dict::LossDict;
use super::functional::{log_softmax, softmax};
use crate::arch::ModelOutput;
use crate::data::Batch;
use crate::loss::Loss;
use crate::{Error, Result};
use ndarray::{Array1, Array2};

/// Target of one cross-entropy evaluation: integer class labels or a second
/// logit tensor treated as a soft distribution.
#[derive(Debug, Clone, Copy)]
pub enum TargetRef<'a> {
    Hard(&'a Array1<i64>),
    Soft(&'a Array2<f32>),
}

/// Softmax cross-entropy. With `epsilon` set, hard labels are smoothed to
/// `1 - epsilon` on the true class and `epsilon / classes` elsewhere.
#[derive(Debug, Clone)]
pub struct CELoss {
    name: String,
    epsilon: Option<f32>,
}

impl CELoss {
    pub fn new(epsilon: Option<f32>) -> Result<Self> {
        if let Some(e) = epsilon {
            if !(0.0..1.0).contains(&e) {
                return Err(Error::config(
                    "CELoss.epsilon",
                    format!("smoothing {e} must be in [0, 1)"),
                ));
            }
        }
        Ok(Self {
            name: "CELoss".to_string(),
            epsilon,
        })
    }

    pub fn compute(&self, logits: &Array2<f32>, target: TargetRef<'_>) -> Result<LossDict> {
        let n = logits.nrows();
        if n == 0 {
            return Err(Error::DegenerateBatch("empty batch for cross-entropy".into()));
        }
        let classes = logits.ncols();
        let log_p = log_softmax(logits);
        let loss = match target {
            TargetRef::Hard(labels) => {
                if labels.len() != n {
                    return Err(Error::DegenerateBatch(format!(
                        "{n} logits rows but {} labels",
                        labels.len()
                    )));
                }
                let mut total = 0.0;
                for (i, &label) in labels.iter().enumerate() {
                    let c = label as usize;
                    if label < 0 || c >= classes {
                        return Err(Error::DegenerateBatch(format!(
                            "label {label} out of range for {classes} classes"
                        )));
                    }
                    total += match self.epsilon {
                        None => -log_p[[i, c]],
                        Some(e) => {
                            let off = e / classes as f32;
                            let mut row_loss = 0.0;
                            for j in 0..classes {
                                let q = if j == c { 1.0 - e + off } else { off };
                                row_loss -= q * log_p[[i, j]];
                            }
                            row_loss
                        }
                    };
                }
                total / n as f32
            }
            TargetRef::Soft(target_logits) => {
                if target_logits.raw_dim() != logits.raw_dim() {
                    return Err(Error::DegenerateBatch(
                        "soft target shape does not match logits".into(),
                    ));
                }
                let q = softmax(target_logits);
                -(q * &log_p).sum() / n as f32
            }
        };
        Ok(LossDict::single(&self.name, loss))
    }
}

impl Loss for CELoss {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, predicts: &ModelOutput, batch: &Batch) -> Result<LossDict> {
        self.compute(predicts.primary()?, TargetRef::Hard(&batch.labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_perfect_prediction_is_near_zero() {
        let loss = CELoss::new(None).unwrap();
        let logits = array![[20.0_f32, 0.0], [0.0, 20.0]];
        let labels = array![0_i64, 1];
        let d = loss.compute(&logits, TargetRef::Hard(&labels)).unwrap();
        assert!(d.get("CELoss").unwrap() < 1e-3);
    }

    #[test]
    fn test_uniform_logits_log_classes() {
        let loss = CELoss::new(None).unwrap();
        let logits = Array2::zeros((2, 4));
        let labels = array![0_i64, 3];
        let d = loss.compute(&logits, TargetRef::Hard(&labels)).unwrap();
        assert_relative_eq!(d.get("CELoss").unwrap(), (4.0_f32).ln(), epsilon = 1e-5);
    }

    #[test]
    fn test_smoothing_penalizes_certainty() {
        let sharp = array![[30.0_f32, -30.0]];
        let labels = array![0_i64];
        let plain = CELoss::new(None).unwrap();
        let smooth = CELoss::new(Some(0.1)).unwrap();
        let a = plain.compute(&sharp, TargetRef::Hard(&labels)).unwrap();
        let b = smooth.compute(&sharp, TargetRef::Hard(&labels)).unwrap();
        assert!(b.get("CELoss").unwrap() > a.get("CELoss").unwrap());
    }

    #[test]
    fn test_soft_target_agreement() {
        let loss = CELoss::new(None).unwrap();
        let logits = array![[2.0_f32, 0.0, -2.0]];
        let same = loss.compute(&logits, TargetRef::Soft(&logits)).unwrap();
        let other = array![[-2.0_f32, 0.0, 2.0]];
        let diff = loss.compute(&logits, TargetRef::Soft(&other)).unwrap();
        assert!(same.get("CELoss").unwrap() < diff.get("CELoss").unwrap());
    }

    #[test]
    fn test_invalid_epsilon() {
        assert!(CELoss::new(Some(1.5)).is_err());
    }

    #[test]
    fn test_out_of_range_label() {
        let loss = CELoss::new(None).unwrap();
        let logits = Array2::zeros((1, 2));
        let labels = array![7_i64];
        assert!(loss.compute(&logits, TargetRef::Hard(&labels)).is_err());
    }
}
