//! Checkpoint persistence
//!
//! The engine talks to persistence through the [`Checkpointer`] seam; the
//! built-in implementation serializes snapshots as JSON files, one per
//! checkpoint name (`best`, `latest`, `epoch_N`, ...).

use crate::arch::Model;
use crate::{Error, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Flat row-major tensor for on-disk storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerializedTensor {
    pub name: String,
    pub shape: [usize; 2],
    pub data: Vec<f32>,
}

impl SerializedTensor {
    pub fn from_array(name: &str, array: &Array2<f32>) -> Self {
        Self {
            name: name.to_string(),
            shape: [array.nrows(), array.ncols()],
            data: array.iter().copied().collect(),
        }
    }

    pub fn to_array(&self) -> Result<Array2<f32>> {
        Array2::from_shape_vec((self.shape[0], self.shape[1]), self.data.clone())
            .map_err(|e| Error::Serialization(format!("tensor `{}`: {e}", self.name)))
    }
}

/// Headline metric with the epoch that produced it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct MetricInfo {
    pub metric: f32,
    pub epoch: usize,
}

impl Default for MetricInfo {
    fn default() -> Self {
        Self {
            metric: f32::NEG_INFINITY,
            epoch: 0,
        }
    }
}

/// One complete checkpoint: weights, training progress and optional EMA
/// shadow weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub params: Vec<SerializedTensor>,
    pub metric_info: MetricInfo,
    pub ema: Option<Vec<SerializedTensor>>,
}

impl Snapshot {
    pub fn from_model(model: &dyn Model, metric_info: MetricInfo) -> Self {
        Self {
            params: model
                .parameters()
                .iter()
                .map(|p| SerializedTensor::from_array(&p.name, &p.data))
                .collect(),
            metric_info,
            ema: None,
        }
    }

    pub fn with_ema(mut self, shadow: &[Array2<f32>]) -> Self {
        self.ema = Some(
            shadow
                .iter()
                .enumerate()
                .map(|(i, a)| SerializedTensor::from_array(&format!("ema_{i}"), a))
                .collect(),
        );
        self
    }

    /// Write the stored weights back into a model, checking shapes.
    pub fn restore_into(&self, model: &mut dyn Model) -> Result<()> {
        let mut params = model.parameters_mut();
        if params.len() != self.params.len() {
            return Err(Error::Serialization(format!(
                "checkpoint has {} tensors but model has {} parameters",
                self.params.len(),
                params.len()
            )));
        }
        for (p, t) in params.iter_mut().zip(&self.params) {
            let array = t.to_array()?;
            if array.raw_dim() != p.data.raw_dim() {
                return Err(Error::Serialization(format!(
                    "tensor `{}` shape {:?} does not match parameter shape {:?}",
                    t.name,
                    t.shape,
                    p.data.shape()
                )));
            }
            p.data = array;
        }
        Ok(())
    }
}

/// Persistence seam between the engine and storage.
pub trait Checkpointer {
    /// Persist a snapshot under `prefix` inside `dir`, overwriting any
    /// previous checkpoint of the same name.
    fn save(&self, dir: &Path, prefix: &str, snapshot: &Snapshot) -> Result<()>;

    /// Load the snapshot named `prefix`, or `None` when absent.
    fn load(&self, dir: &Path, prefix: &str) -> Result<Option<Snapshot>>;

    /// Load pretrained weights from a path into the model.
    fn load_pretrained(&self, source: &str, model: &mut dyn Model) -> Result<()>;
}

/// JSON-file checkpointer; each checkpoint is `<prefix>.json` in the
/// output directory.
#[derive(Debug, Default, Clone)]
pub struct JsonCheckpointer;

impl JsonCheckpointer {
    fn path(dir: &Path, prefix: &str) -> PathBuf {
        dir.join(format!("{prefix}.json"))
    }
}

impl Checkpointer for JsonCheckpointer {
    fn save(&self, dir: &Path, prefix: &str, snapshot: &Snapshot) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let file = File::create(Self::path(dir, prefix))?;
        serde_json::to_writer(BufWriter::new(file), snapshot)
            .map_err(|e| Error::Serialization(format!("checkpoint `{prefix}`: {e}")))
    }

    fn load(&self, dir: &Path, prefix: &str) -> Result<Option<Snapshot>> {
        let path = Self::path(dir, prefix);
        if !path.is_file() {
            return Ok(None);
        }
        let file = File::open(&path)?;
        let snapshot = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Serialization(format!("checkpoint `{prefix}`: {e}")))?;
        Ok(Some(snapshot))
    }

    fn load_pretrained(&self, source: &str, model: &mut dyn Model) -> Result<()> {
        if source.starts_with("http://") || source.starts_with("https://") {
            return Err(Error::config(
                "Global.pretrained_model",
                "remote weights are not supported by the file checkpointer; download first",
            ));
        }
        let path = Path::new(source);
        if !path.is_file() {
            return Err(Error::ResourceMissing(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let snapshot: Snapshot = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Serialization(format!("pretrained `{source}`: {e}")))?;
        snapshot.restore_into(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::LinearClassifier;
    use crate::engine::RngState;

    fn model(seed: u64) -> LinearClassifier {
        LinearClassifier::new(3, 2, &mut RngState::from_seed(seed)).unwrap()
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let m = model(1);
        let info = MetricInfo {
            metric: 0.75,
            epoch: 4,
        };
        let snapshot = Snapshot::from_model(&m, info);
        let ckpt = JsonCheckpointer;
        ckpt.save(dir.path(), "latest", &snapshot).unwrap();

        let loaded = ckpt.load(dir.path(), "latest").unwrap().unwrap();
        assert_eq!(loaded.metric_info, info);

        let mut other = model(2);
        loaded.restore_into(&mut other).unwrap();
        for (a, b) in other.parameters().iter().zip(m.parameters().iter()) {
            assert_eq!(a.data, b.data);
        }
    }

    #[test]
    fn test_load_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(JsonCheckpointer.load(dir.path(), "best").unwrap().is_none());
    }

    #[test]
    fn test_remote_pretrained_rejected() {
        let mut m = model(1);
        let err = JsonCheckpointer
            .load_pretrained("https://example.com/w.json", &mut m)
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_missing_pretrained_path() {
        let mut m = model(1);
        let err = JsonCheckpointer
            .load_pretrained("/no/such/weights.json", &mut m)
            .unwrap_err();
        assert!(matches!(err, Error::ResourceMissing(_)));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let big = LinearClassifier::new(5, 4, &mut RngState::from_seed(1)).unwrap();
        let snapshot = Snapshot::from_model(&big, MetricInfo::default());
        JsonCheckpointer.save(dir.path(), "latest", &snapshot).unwrap();

        let mut small = model(1);
        let loaded = JsonCheckpointer.load(dir.path(), "latest").unwrap().unwrap();
        assert!(loaded.restore_into(&mut small).is_err());
    }
}
