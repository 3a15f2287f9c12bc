//! Nested model-output structure

use crate::{Error, Result};
use ndarray::Array2;

/// Output of one forward pass: either a plain tensor or a named mapping of
/// further outputs (sub-model name to output, or output key to tensor).
///
/// Entries keep insertion order so downstream logging is stable.
#[derive(Debug, Clone)]
pub enum ModelOutput {
    Tensor(Array2<f32>),
    Map(Vec<(String, ModelOutput)>),
}

impl ModelOutput {
    pub fn map(entries: Vec<(String, ModelOutput)>) -> Result<Self> {
        for (i, (name, _)) in entries.iter().enumerate() {
            if entries[..i].iter().any(|(n, _)| n == name) {
                return Err(Error::config(
                    "model output",
                    format!("duplicate output key `{name}`"),
                ));
            }
        }
        Ok(ModelOutput::Map(entries))
    }

    /// Look up a named entry; a miss or a tensor node is a configuration
    /// error naming the absent key.
    pub fn get(&self, key: &str) -> Result<&ModelOutput> {
        match self {
            ModelOutput::Map(entries) => entries
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, v)| v)
                .ok_or_else(|| {
                    Error::config("model output", format!("no output named `{key}`"))
                }),
            ModelOutput::Tensor(_) => Err(Error::config(
                "model output",
                format!("expected a named output mapping when looking up `{key}`"),
            )),
        }
    }

    pub fn as_tensor(&self) -> Result<&Array2<f32>> {
        match self {
            ModelOutput::Tensor(t) => Ok(t),
            ModelOutput::Map(_) => Err(Error::config(
                "model output",
                "expected a tensor, found a named output mapping",
            )),
        }
    }

    /// Tensor at `key`, falling back to the output itself when no key is
    /// configured.
    pub fn tensor_at(&self, key: Option<&str>) -> Result<&Array2<f32>> {
        match key {
            Some(k) => self.get(k)?.as_tensor(),
            None => self.as_tensor(),
        }
    }

    /// Unwrap a nested output to its primary tensor by fixed precedence:
    /// a tensor is itself; a mapping yields its `Student`, then `logits`,
    /// then `output` entry, recursively. Anything else is an error.
    pub fn primary(&self) -> Result<&Array2<f32>> {
        match self {
            ModelOutput::Tensor(t) => Ok(t),
            ModelOutput::Map(entries) => {
                for key in ["Student", "logits", "output"] {
                    if let Some((_, v)) = entries.iter().find(|(n, _)| n == key) {
                        return v.primary();
                    }
                }
                Err(Error::config(
                    "model output",
                    "no `Student`, `logits` or `output` entry to unwrap",
                ))
            }
        }
    }

    pub fn keys(&self) -> Vec<&str> {
        match self {
            ModelOutput::Tensor(_) => Vec::new(),
            ModelOutput::Map(entries) => entries.iter().map(|(n, _)| n.as_str()).collect(),
        }
    }
}
