//! Temperature-scaled KL divergence

use super::dict::LossDict;
use super::functional::{kl_div_sum, log_softmax, softmax};
use crate::{Error, Result};
use ndarray::Array2;

/// KL divergence between temperature-softened distributions, scaled by
/// `T^2` so the gradient magnitude stays comparable across temperatures.
#[derive(Debug, Clone)]
pub struct KLDivLoss {
    name: String,
    temperature: f32,
}

impl KLDivLoss {
    pub fn new(temperature: f32) -> Result<Self> {
        if temperature <= 0.0 {
            return Err(Error::config(
                "KLDivLoss.temperature",
                format!("temperature {temperature} must be positive"),
            ));
        }
        Ok(Self {
            name: "KLDivLoss".to_string(),
            temperature,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// KL(teacher || student) over softened distributions, batch-mean.
    pub fn compute(&self, student: &Array2<f32>, teacher: &Array2<f32>) -> Result<LossDict> {
        if student.raw_dim() != teacher.raw_dim() {
            return Err(Error::DegenerateBatch(
                "KL-divergence inputs must share a shape".into(),
            ));
        }
        let n = student.nrows();
        if n == 0 {
            return Err(Error::DegenerateBatch("empty batch for KL loss".into()));
        }
        let t = self.temperature;
        let log_s = log_softmax(&(student / t));
        let soft_t = softmax(&(teacher / t));
        let loss = kl_div_sum(&log_s, &soft_t) * t * t / n as f32;
        Ok(LossDict::single(&self.name, loss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_identical_inputs_zero() {
        let x = array![[3.0_f32, -1.0, 0.0]];
        let d = KLDivLoss::new(4.0).unwrap().compute(&x, &x).unwrap();
        assert_relative_eq!(d.get("KLDivLoss").unwrap(), 0.0, epsilon = 1e-5);
    }

    #[test]
    fn test_divergent_inputs_positive() {
        let s = array![[4.0_f32, 0.0]];
        let t = array![[0.0_f32, 4.0]];
        let d = KLDivLoss::new(1.0).unwrap().compute(&s, &t).unwrap();
        assert!(d.get("KLDivLoss").unwrap() > 0.0);
    }

    #[test]
    fn test_temperature_must_be_positive() {
        assert!(KLDivLoss::new(0.0).is_err());
        assert!(KLDivLoss::new(-2.0).is_err());
    }
}
