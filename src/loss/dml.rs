//! Deep mutual learning loss

use super::dict::LossDict;
use super::functional::{kl_div_sum, log_softmax, softmax};
use crate::{Error, Result};
use ndarray::Array2;

/// Symmetric KL divergence between two logit tensors, the mutual-learning
/// signal between peer models.
#[derive(Debug, Clone)]
pub struct DMLLoss {
    name: String,
}

impl DMLLoss {
    pub fn new() -> Self {
        Self {
            name: "DMLLoss".to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compute(&self, x: &Array2<f32>, y: &Array2<f32>) -> Result<LossDict> {
        if x.raw_dim() != y.raw_dim() {
            return Err(Error::DegenerateBatch(
                "mutual-learning inputs must share a shape".into(),
            ));
        }
        let n = x.nrows();
        if n == 0 {
            return Err(Error::DegenerateBatch("empty batch for DML loss".into()));
        }
        let px = softmax(x);
        let py = softmax(y);
        let forward = kl_div_sum(&log_softmax(y), &px);
        let backward = kl_div_sum(&log_softmax(x), &py);
        let loss = (forward + backward) / (2.0 * n as f32);
        Ok(LossDict::single(&self.name, loss))
    }
}

impl Default for DMLLoss {
    fn default() -> Self {
        Self::new()
    }
}
