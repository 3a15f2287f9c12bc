//! Cross-batch memory bank
//!
//! A fixed-capacity circular cache of recent (feature, label) pairs used to
//! extend the effective batch of metric-learning losses without memory
//! proportional to the dataset. One instance lives for the whole training
//! run and is mutated exactly once per step by the owning process; callers
//! using `get` and `enqueue_dequeue` from multiple sites must treat the pair
//! as a single critical section per step.
//!
//! The wrap policy is deliberately simple: when an incoming batch does not
//! fit before the end of the buffer, it overwrites the *last* `n` slots and
//! the write pointer resets to 0. Strict FIFO order is not preserved at the
//! wrap boundary, so callers may rely only on membership of resident
//! entries, never on their order.

use crate::{Error, Result};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};

/// Fixed-size circular feature/label cache
#[derive(Debug, Clone)]
pub struct CrossBatchMemory {
    capacity: usize,
    feat_dim: usize,
    feats: Array2<f32>,
    targets: Array1<i64>,
    ptr: usize,
    cur_size: usize,
}

impl CrossBatchMemory {
    /// Create a zero-initialized memory bank.
    pub fn new(capacity: usize, feat_dim: usize) -> Result<Self> {
        if capacity == 0 || feat_dim == 0 {
            return Err(Error::config(
                "CrossBatchMemory",
                format!("capacity ({capacity}) and feat_dim ({feat_dim}) must be positive"),
            ));
        }
        Ok(Self {
            capacity,
            feat_dim,
            feats: Array2::zeros((capacity, feat_dim)),
            targets: Array1::zeros(capacity),
            ptr: 0,
            cur_size: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn feat_dim(&self) -> usize {
        self.feat_dim
    }

    /// Current write pointer, always in `[0, capacity)`.
    pub fn ptr(&self) -> usize {
        self.ptr
    }

    /// Number of resident entries, clamped to capacity.
    pub fn len(&self) -> usize {
        self.cur_size
    }

    pub fn is_empty(&self) -> bool {
        self.cur_size == 0
    }

    pub fn is_full(&self) -> bool {
        self.cur_size >= self.capacity
    }

    /// Resident features and labels. Returns the `[..ptr]` prefix until the
    /// bank fills, then the whole buffers.
    pub fn get(&self) -> (ArrayView2<'_, f32>, ArrayView1<'_, i64>) {
        if self.is_full() {
            (self.feats.view(), self.targets.view())
        } else {
            (
                self.feats.slice(s![..self.ptr, ..]),
                self.targets.slice(s![..self.ptr]),
            )
        }
    }

    /// Insert a batch of features and labels, evicting old entries.
    ///
    /// Errors on an empty batch, a batch larger than the whole bank, or a
    /// feature-dimension mismatch; none of those are meaningful writes.
    pub fn enqueue_dequeue(
        &mut self,
        feats: ArrayView2<'_, f32>,
        targets: ArrayView1<'_, i64>,
    ) -> Result<()> {
        let n = targets.len();
        if n == 0 {
            return Err(Error::DegenerateBatch(
                "cannot enqueue an empty batch into cross-batch memory".to_string(),
            ));
        }
        if n > self.capacity {
            return Err(Error::DegenerateBatch(format!(
                "batch of {n} entries exceeds memory capacity {}",
                self.capacity
            )));
        }
        if feats.nrows() != n || feats.ncols() != self.feat_dim {
            return Err(Error::config(
                "CrossBatchMemory",
                format!(
                    "feature shape [{}, {}] does not match batch {n} x feat_dim {}",
                    feats.nrows(),
                    feats.ncols(),
                    self.feat_dim
                ),
            ));
        }

        if self.ptr + n > self.capacity {
            let start = self.capacity - n;
            self.feats.slice_mut(s![start.., ..]).assign(&feats);
            self.targets.slice_mut(s![start..]).assign(&targets);
            self.ptr = 0;
        } else {
            self.feats
                .slice_mut(s![self.ptr..self.ptr + n, ..])
                .assign(&feats);
            self.targets
                .slice_mut(s![self.ptr..self.ptr + n])
                .assign(&targets);
            self.ptr += n;
        }
        self.cur_size = (self.cur_size + n).min(self.capacity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn batch(n: usize, dim: usize, offset: f32) -> (Array2<f32>, Array1<i64>) {
        let feats = Array2::from_shape_fn((n, dim), |(i, j)| offset + (i * dim + j) as f32);
        let targets = Array1::from_iter((0..n).map(|i| (offset as i64) * 100 + i as i64));
        (feats, targets)
    }

    #[test]
    fn test_non_wrap_insertion_order() {
        let mut bank = CrossBatchMemory::new(10, 4).unwrap();
        let (f1, t1) = batch(3, 4, 1.0);
        let (f2, t2) = batch(4, 4, 2.0);
        bank.enqueue_dequeue(f1.view(), t1.view()).unwrap();
        bank.enqueue_dequeue(f2.view(), t2.view()).unwrap();

        assert_eq!(bank.ptr(), 7);
        assert!(!bank.is_full());
        let (feats, targets) = bank.get();
        assert_eq!(feats.nrows(), 7);
        assert_eq!(targets.len(), 7);
        // first three rows come from batch one, in insertion order
        assert_eq!(feats.row(0).to_vec(), f1.row(0).to_vec());
        assert_eq!(feats.row(2).to_vec(), f1.row(2).to_vec());
        assert_eq!(feats.row(3).to_vec(), f2.row(0).to_vec());
        assert_eq!(targets[6], t2[3]);
    }

    #[test]
    fn test_wrap_overwrites_tail_and_resets_ptr() {
        let mut bank = CrossBatchMemory::new(10, 4).unwrap();
        let (f1, t1) = batch(7, 4, 1.0);
        let (f2, t2) = batch(7, 4, 2.0);
        bank.enqueue_dequeue(f1.view(), t1.view()).unwrap();
        bank.enqueue_dequeue(f2.view(), t2.view()).unwrap();

        assert_eq!(bank.ptr(), 0);
        assert!(bank.is_full());
        let (feats, targets) = bank.get();
        assert_eq!(feats.nrows(), 10);
        // the last 7 rows hold the second batch, in order
        for i in 0..7 {
            assert_eq!(feats.row(3 + i).to_vec(), f2.row(i).to_vec());
            assert_eq!(targets[3 + i], t2[i]);
        }
    }

    #[test]
    fn test_cur_size_clamped_at_capacity() {
        let mut bank = CrossBatchMemory::new(8, 2).unwrap();
        let (f, t) = batch(5, 2, 1.0);
        for _ in 0..10 {
            bank.enqueue_dequeue(f.view(), t.view()).unwrap();
        }
        assert_eq!(bank.len(), 8);
        assert!(bank.is_full());
    }

    #[test]
    fn test_exact_fit_advances_to_boundary() {
        let mut bank = CrossBatchMemory::new(6, 2).unwrap();
        let (f, t) = batch(6, 2, 3.0);
        bank.enqueue_dequeue(f.view(), t.view()).unwrap();
        // ptr + n == capacity is not a wrap
        assert_eq!(bank.ptr(), 6);
        assert!(bank.is_full());
        let (feats, _) = bank.get();
        assert_eq!(feats.row(0).to_vec(), f.row(0).to_vec());
    }

    #[test]
    fn test_oversized_batch_rejected() {
        let mut bank = CrossBatchMemory::new(4, 2).unwrap();
        let (f, t) = batch(5, 2, 1.0);
        let err = bank.enqueue_dequeue(f.view(), t.view()).unwrap_err();
        assert!(matches!(err, crate::Error::DegenerateBatch(_)));
    }

    #[test]
    fn test_empty_batch_rejected() {
        let mut bank = CrossBatchMemory::new(4, 2).unwrap();
        let feats = Array2::<f32>::zeros((0, 2));
        let targets = Array1::<i64>::zeros(0);
        assert!(bank.enqueue_dequeue(feats.view(), targets.view()).is_err());
    }

    #[test]
    fn test_dim_mismatch_rejected() {
        let mut bank = CrossBatchMemory::new(4, 3).unwrap();
        let feats = array![[1.0_f32, 2.0]];
        let targets = array![1_i64];
        assert!(bank.enqueue_dequeue(feats.view(), targets.view()).is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(CrossBatchMemory::new(0, 4).is_err());
        assert!(CrossBatchMemory::new(4, 0).is_err());
    }
}
