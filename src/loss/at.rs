//! Attention-transfer loss

use super::dict::LossDict;
use super::functional::{attention_map, mse};
use crate::{Error, Result};
use ndarray::Array2;

/// Mean squared error between normalized attention maps of matched
/// student/teacher activation tensors, summed over the matched list.
#[derive(Debug, Clone)]
pub struct ATLoss {
    name: String,
    p: i32,
}

impl ATLoss {
    pub fn new(p: i32) -> Result<Self> {
        if p <= 0 {
            return Err(Error::config(
                "ATLoss.p",
                format!("attention power {p} must be positive"),
            ));
        }
        Ok(Self {
            name: "ATLoss".to_string(),
            p,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn compute(&self, students: &[&Array2<f32>], teachers: &[&Array2<f32>]) -> Result<LossDict> {
        if students.len() != teachers.len() || students.is_empty() {
            return Err(Error::config(
                "ATLoss",
                format!(
                    "need equally many non-empty activation lists, got {} and {}",
                    students.len(),
                    teachers.len()
                ),
            ));
        }
        let mut total = 0.0;
        for (s, t) in students.iter().zip(teachers) {
            if s.raw_dim() != t.raw_dim() {
                return Err(Error::DegenerateBatch(
                    "attention-transfer activations must share a shape".into(),
                ));
            }
            total += mse(&attention_map(s, self.p), &attention_map(t, self.p));
        }
        Ok(LossDict::single(&self.name, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_identical_activations_zero() {
        let x = array![[1.0_f32, 2.0, 3.0], [0.5, 0.5, 0.5]];
        let at = ATLoss::new(2).unwrap();
        let d = at.compute(&[&x], &[&x]).unwrap();
        assert_relative_eq!(d.get("ATLoss").unwrap(), 0.0, epsilon = 1e-7);
    }

    #[test]
    fn test_scale_invariance_of_attention() {
        // attention maps are normalized, so a uniform scale changes nothing
        let x = array![[1.0_f32, 2.0, 3.0]];
        let y = &x * 10.0;
        let at = ATLoss::new(2).unwrap();
        let d = at.compute(&[&x], &[&y]).unwrap();
        assert_relative_eq!(d.get("ATLoss").unwrap(), 0.0, epsilon = 1e-7);
    }

    #[test]
    fn test_mismatched_lists_rejected() {
        let x = array![[1.0_f32]];
        let at = ATLoss::new(2).unwrap();
        assert!(at.compute(&[&x], &[]).is_err());
        assert!(at.compute(&[], &[]).is_err());
    }
}
