//! Feature-distance losses

use super::dict::LossDict;
use super::functional::smooth_l1_mean;
use crate::{Error, Result};
use ndarray::Array2;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMode {
    L1,
    L2,
    SmoothL1,
}

impl FromStr for DistanceMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "l1" => Ok(Self::L1),
            "l2" => Ok(Self::L2),
            "smooth_l1" => Ok(Self::SmoothL1),
            _ => Err(Error::config(
                "DistanceLoss.mode",
                format!("mode `{s}` must be one of [l1, l2, smooth_l1]"),
            )),
        }
    }
}

/// Elementwise distance between two feature tensors, mean-reduced. The term
/// key encodes the mode (`loss_l2`, ...) so different modes coexist in one
/// composed loss.
#[derive(Debug, Clone)]
pub struct DistanceLoss {
    mode: DistanceMode,
    name: String,
}

impl DistanceLoss {
    pub fn new(mode: DistanceMode) -> Self {
        let name = match mode {
            DistanceMode::L1 => "loss_l1",
            DistanceMode::L2 => "loss_l2",
            DistanceMode::SmoothL1 => "loss_smooth_l1",
        };
        Self {
            mode,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compute(&self, x: &Array2<f32>, y: &Array2<f32>) -> Result<LossDict> {
        if x.raw_dim() != y.raw_dim() {
            return Err(Error::DegenerateBatch(
                "distance-loss inputs must share a shape".into(),
            ));
        }
        if x.is_empty() {
            return Err(Error::DegenerateBatch("empty batch for distance loss".into()));
        }
        let n = x.len() as f32;
        let loss = match self.mode {
            DistanceMode::L1 => {
                x.iter().zip(y.iter()).map(|(a, b)| (a - b).abs()).sum::<f32>() / n
            }
            DistanceMode::L2 => {
                x.iter().zip(y.iter()).map(|(a, b)| (a - b) * (a - b)).sum::<f32>() / n
            }
            DistanceMode::SmoothL1 => smooth_l1_mean(x, y),
        };
        Ok(LossDict::single(&self.name, loss))
    }
}
