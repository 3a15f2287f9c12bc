//! Exponential moving average of model weights

use crate::arch::{Model, Param};
use crate::{Error, Result};
use ndarray::Array2;

/// Shadow copy of the trainable weights, updated as a decayed running
/// average after every optimizer step and evaluated separately from the
/// live model.
pub struct ExponentialMovingAverage {
    decay: f32,
    shadow: Vec<Array2<f32>>,
}

impl ExponentialMovingAverage {
    pub fn new(model: &dyn Model, decay: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&decay) {
            return Err(Error::config(
                "EMA.decay",
                format!("decay {decay} must be in [0, 1)"),
            ));
        }
        Ok(Self {
            decay,
            shadow: model.parameters().iter().map(|p| p.data.clone()).collect(),
        })
    }

    fn check(&self, params: &[&Param]) -> Result<()> {
        if params.len() != self.shadow.len() {
            return Err(Error::config(
                "EMA",
                format!(
                    "parameter count changed mid-run: {} shadowed, {} given",
                    self.shadow.len(),
                    params.len()
                ),
            ));
        }
        Ok(())
    }

    /// Fold the live weights into the shadow.
    pub fn update(&mut self, model: &dyn Model) -> Result<()> {
        let params = model.parameters();
        self.check(&params)?;
        for (s, p) in self.shadow.iter_mut().zip(&params) {
            *s = &*s * self.decay + &(&p.data * (1.0 - self.decay));
        }
        Ok(())
    }

    /// Swap shadow and live weights in place. Calling twice restores the
    /// original assignment; the train loop brackets EMA evaluation with a
    /// swap pair.
    pub fn swap(&mut self, model: &mut dyn Model) -> Result<()> {
        let mut params = model.parameters_mut();
        if params.len() != self.shadow.len() {
            return Err(Error::config(
                "EMA",
                format!(
                    "parameter count changed mid-run: {} shadowed, {} given",
                    self.shadow.len(),
                    params.len()
                ),
            ));
        }
        for (s, p) in self.shadow.iter_mut().zip(params.iter_mut()) {
            std::mem::swap(s, &mut p.data);
        }
        Ok(())
    }

    /// Re-snapshot the shadow from the live weights, e.g. after a resumed
    /// run restored a checkpoint into the model.
    pub fn reset_from(&mut self, model: &dyn Model) {
        self.shadow = model.parameters().iter().map(|p| p.data.clone()).collect();
    }

    pub fn shadow_weights(&self) -> &[Array2<f32>] {
        &self.shadow
    }
}
