//! Shared numeric kernels for the loss family

use ndarray::{Array1, Array2, Axis};

/// Row-wise softmax with max-subtraction for stability.
pub fn softmax(x: &Array2<f32>) -> Array2<f32> {
    let mut out = x.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum: f32 = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// Row-wise log-softmax.
pub fn log_softmax(x: &Array2<f32>) -> Array2<f32> {
    let mut out = x.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let log_sum = row.iter().map(|v| (v - max).exp()).sum::<f32>().ln() + max;
        row.mapv_inplace(|v| v - log_sum);
    }
    out
}

/// Row index of the per-row maximum.
pub fn argmax_rows(x: &Array2<f32>) -> Array1<i64> {
    Array1::from_iter(x.rows().into_iter().map(|row| {
        row.iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i as i64)
            .unwrap_or(0)
    }))
}

/// Sum of `q * (ln q - log_p)` over all entries, the summed forward KL term
/// against already-log-transformed predictions.
pub fn kl_div_sum(log_p: &Array2<f32>, q: &Array2<f32>) -> f32 {
    log_p
        .iter()
        .zip(q.iter())
        .map(|(&lp, &qv)| if qv > 0.0 { qv * (qv.ln() - lp) } else { 0.0 })
        .sum()
}

/// Elementwise smooth-L1 (Huber with delta = 1), mean-reduced.
pub fn smooth_l1_mean(a: &Array2<f32>, b: &Array2<f32>) -> f32 {
    let n = a.len().max(1);
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = (x - y).abs();
            if d < 1.0 {
                0.5 * d * d
            } else {
                d - 0.5
            }
        })
        .sum::<f32>()
        / n as f32
}

/// Euclidean pairwise distance matrix between the rows of `x`.
pub fn pairwise_distances(x: &Array2<f32>) -> Array2<f32> {
    let n = x.nrows();
    let mut out = Array2::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let d = x
                .row(i)
                .iter()
                .zip(x.row(j).iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>()
                .sqrt();
            out[[i, j]] = d;
            out[[j, i]] = d;
        }
    }
    out
}

/// L2-normalize rows in place; zero rows are left untouched.
pub fn normalize_rows(x: &mut Array2<f32>) {
    for mut row in x.rows_mut() {
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|v| v / norm);
        }
    }
}

/// Mean of a 2-d array, 0 for an empty one.
pub fn mean(x: &Array2<f32>) -> f32 {
    x.mean().unwrap_or(0.0)
}

/// Mean squared error, mean-reduced over all entries.
pub fn mse(a: &Array2<f32>, b: &Array2<f32>) -> f32 {
    let n = a.len().max(1);
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x - y) * (x - y))
        .sum::<f32>()
        / n as f32
}

/// Sum rows down to a single attention vector per sample: `sum_c x_c^p`.
pub fn attention_map(x: &Array2<f32>, p: i32) -> Array2<f32> {
    let mut out = x.mapv(|v| v.abs().powi(p));
    let sums = out.sum_axis(Axis(1));
    for (mut row, &s) in out.rows_mut().into_iter().zip(sums.iter()) {
        if s > 0.0 {
            row.mapv_inplace(|v| v / s);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let x = array![[1.0_f32, 2.0, 3.0], [100.0, 100.0, 100.0]];
        let p = softmax(&x);
        for row in p.rows() {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
        assert!(p[[0, 2]] > p[[0, 0]]);
    }

    #[test]
    fn test_log_softmax_matches_softmax() {
        let x = array![[0.5_f32, -1.0, 2.0]];
        let p = softmax(&x);
        let lp = log_softmax(&x);
        for (a, b) in p.iter().zip(lp.iter()) {
            assert_relative_eq!(a.ln(), *b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_kl_div_zero_for_identical() {
        let x = array![[0.2_f32, 0.3, 0.5]];
        let kl = kl_div_sum(&x.mapv(f32::ln), &x);
        assert_relative_eq!(kl, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_pairwise_distances_symmetry() {
        let x = array![[0.0_f32, 0.0], [3.0, 4.0], [0.0, 1.0]];
        let d = pairwise_distances(&x);
        assert_relative_eq!(d[[0, 1]], 5.0, epsilon = 1e-6);
        assert_relative_eq!(d[[1, 0]], 5.0, epsilon = 1e-6);
        assert_relative_eq!(d[[0, 0]], 0.0);
    }

    #[test]
    fn test_argmax_rows() {
        let x = array![[0.1_f32, 0.9], [0.8, 0.2]];
        assert_eq!(argmax_rows(&x), array![1_i64, 0]);
    }
}
