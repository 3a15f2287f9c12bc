//! Ordered loss-term dictionary with loud collision handling

use crate::{Error, Result};

/// Ordered mapping from loss-term name to scalar value.
///
/// Inserting a key twice is an error rather than an overwrite: a collision
/// means two configured loss terms produced the same composite name, which
/// silently dropping one of them would hide.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossDict {
    terms: Vec<(String, f32)>,
}

impl LossDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: f32) -> Result<()> {
        let key = key.into();
        if self.contains(&key) {
            return Err(Error::LossKeyCollision(key));
        }
        self.terms.push((key, value));
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.terms.iter().any(|(k, _)| k == key)
    }

    pub fn get(&self, key: &str) -> Option<f32> {
        self.terms.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    /// Fold another dictionary in, failing on any key collision.
    pub fn merge(&mut self, other: LossDict) -> Result<()> {
        for (key, value) in other.terms {
            self.insert(key, value)?;
        }
        Ok(())
    }

    /// Like [`merge`](Self::merge), scaling every incoming value.
    pub fn merge_weighted(&mut self, other: LossDict, weight: f32) -> Result<()> {
        for (key, value) in other.terms {
            self.insert(key, value * weight)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn sum(&self) -> f32 {
        self.terms.iter().map(|(_, v)| v).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.terms.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|(k, _)| k.as_str())
    }

    /// Single-term convenience constructor.
    pub fn single(key: impl Into<String>, value: f32) -> Self {
        Self {
            terms: vec![(key.into(), value)],
        }
    }
}

impl IntoIterator for LossDict {
    type Item = (String, f32);
    type IntoIter = std::vec::IntoIter<(String, f32)>;

    fn into_iter(self) -> Self::IntoIter {
        self.terms.into_iter()
    }
}
