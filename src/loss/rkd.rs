//! Relational knowledge distillation kernels
//!
//! Both kernels compare *relations* between samples rather than individual
//! outputs: distances (second order) and angles (third order) computed
//! within the batch, matched between student and teacher with smooth-L1.

use super::functional::{pairwise_distances, smooth_l1_mean};
use crate::{Error, Result};
use ndarray::Array2;

fn check_pair(student: &Array2<f32>, teacher: &Array2<f32>) -> Result<usize> {
    let n = student.nrows();
    if n != teacher.nrows() {
        return Err(Error::DegenerateBatch(format!(
            "student batch {n} does not match teacher batch {}",
            teacher.nrows()
        )));
    }
    if n < 2 {
        return Err(Error::DegenerateBatch(
            "relational losses need at least two samples".into(),
        ));
    }
    Ok(n)
}

/// Distance-wise RKD: pairwise distance matrices normalized by their mean
/// off-diagonal distance, compared with smooth-L1.
#[derive(Debug, Clone, Default)]
pub struct RkdDistance;

impl RkdDistance {
    pub fn compute(&self, student: &Array2<f32>, teacher: &Array2<f32>) -> Result<f32> {
        let n = check_pair(student, teacher)?;
        let mut ds = pairwise_distances(student);
        let mut dt = pairwise_distances(teacher);
        let off = (n * (n - 1)) as f32;
        let mean_s = ds.sum() / off;
        let mean_t = dt.sum() / off;
        if mean_s > 0.0 {
            ds /= mean_s;
        }
        if mean_t > 0.0 {
            dt /= mean_t;
        }
        Ok(smooth_l1_mean(&ds, &dt))
    }
}

/// Angle-wise RKD: for each anchor, the matrix of cosines between unit
/// difference vectors to every other sample, compared with smooth-L1.
#[derive(Debug, Clone, Default)]
pub struct RkdAngle;

impl RkdAngle {
    fn angle_potentials(x: &Array2<f32>) -> Array2<f32> {
        let n = x.nrows();
        let d = x.ncols();
        // unit difference vectors e[i][j] = (x_j - x_i) / ||x_j - x_i||
        let mut angles = Array2::zeros((n, n * n));
        let mut diffs = vec![0.0_f32; n * n * d];
        for i in 0..n {
            for j in 0..n {
                let mut norm = 0.0;
                for k in 0..d {
                    let v = x[[j, k]] - x[[i, k]];
                    diffs[(i * n + j) * d + k] = v;
                    norm += v * v;
                }
                let norm = norm.sqrt();
                if norm > 0.0 {
                    for k in 0..d {
                        diffs[(i * n + j) * d + k] /= norm;
                    }
                }
            }
        }
        for i in 0..n {
            for j in 0..n {
                for l in 0..n {
                    let mut dot = 0.0;
                    for k in 0..d {
                        dot += diffs[(i * n + j) * d + k] * diffs[(i * n + l) * d + k];
                    }
                    angles[[i, j * n + l]] = dot;
                }
            }
        }
        angles
    }

    pub fn compute(&self, student: &Array2<f32>, teacher: &Array2<f32>) -> Result<f32> {
        check_pair(student, teacher)?;
        let a_s = Self::angle_potentials(student);
        let a_t = Self::angle_potentials(teacher);
        Ok(smooth_l1_mean(&a_s, &a_t))
    }
}
