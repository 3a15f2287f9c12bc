//! Inference postprocessing

use crate::{Error, Result};
use ndarray::ArrayView1;
use std::collections::HashMap;
use std::path::Path;

/// One scored prediction for one input.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_ids: Vec<usize>,
    pub scores: Vec<f32>,
    pub label_names: Vec<String>,
}

/// Top-k class selection over a probability row, with an optional
/// id-to-name mapping loaded from a `id name` text file.
#[derive(Debug, Clone)]
pub struct Topk {
    topk: usize,
    id_map: Option<HashMap<usize, String>>,
}

impl Topk {
    pub fn new(topk: usize) -> Result<Self> {
        if topk == 0 {
            return Err(Error::config("Infer.PostProcess.topk", "must be positive"));
        }
        Ok(Self { topk, id_map: None })
    }

    pub fn with_class_id_map(mut self, path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::ResourceMissing(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let mut map = HashMap::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let (id, name) = line.trim().split_once(' ').ok_or_else(|| {
                Error::config(
                    "Infer.PostProcess.class_id_map_file",
                    format!("malformed line `{line}`"),
                )
            })?;
            let id: usize = id.parse().map_err(|_| {
                Error::config(
                    "Infer.PostProcess.class_id_map_file",
                    format!("non-numeric class id in `{line}`"),
                )
            })?;
            map.insert(id, name.trim().to_string());
        }
        self.id_map = Some(map);
        Ok(self)
    }

    /// Indices of the `topk` largest probabilities, best first.
    pub fn process(&self, probs: ArrayView1<'_, f32>) -> Prediction {
        let mut idx: Vec<usize> = (0..probs.len()).collect();
        idx.sort_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(std::cmp::Ordering::Equal));
        idx.truncate(self.topk);
        let scores = idx.iter().map(|&i| probs[i]).collect();
        let label_names = match &self.id_map {
            Some(map) => idx
                .iter()
                .map(|i| map.get(i).cloned().unwrap_or_default())
                .collect(),
            None => Vec::new(),
        };
        Prediction {
            class_ids: idx,
            scores,
            label_names,
        }
    }
}
