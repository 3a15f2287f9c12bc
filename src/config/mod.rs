//! YAML configuration tree
//!
//! The whole run is driven by one nested, string-keyed mapping loaded once
//! from YAML, override-merged from `key.path=value` options, and read-only
//! afterwards. Components read only their own named subsection
//! (`Global`, `Arch`, `Loss`, `Optimizer`, `Metric`, `DataLoader`, `AMP`,
//! `EMA`, `Infer`); nothing mutates another component's subsection.
//!
//! # Example
//!
//! ```
//! use clasificar::config::Config;
//!
//! let mut config = Config::from_yaml_str("Optimizer:\n  lr: 0.1\n").unwrap();
//! config.apply_overrides(&["Optimizer.lr=0.01"]).unwrap();
//! assert_eq!(config.get_f64("Optimizer.lr"), Some(0.01));
//! ```

mod overrides;

pub use overrides::parse_scalar;

use crate::{Error, Result};
use serde_yaml::{Mapping, Value};
use std::path::Path;

/// Look up a key in a YAML mapping by string key.
pub(crate) fn map_get<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

/// Immutable configuration tree with dot-path access
#[derive(Debug, Clone)]
pub struct Config {
    root: Value,
}

impl Config {
    /// Parse a configuration from a YAML string. The document root must be
    /// a mapping.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let root: Value = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Serialization(format!("invalid config YAML: {e}")))?;
        if !root.is_mapping() {
            return Err(Error::config("<root>", "config root must be a mapping"));
        }
        Ok(Self { root })
    }

    /// Load a configuration from a YAML file. The path is checked eagerly.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::ResourceMissing(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Apply `key.path=value` override options in order. Missing mapping
    /// levels are created with a printed notice; list levels are addressed
    /// by numeric index and must already exist.
    pub fn apply_overrides<S: AsRef<str>>(&mut self, options: &[S]) -> Result<()> {
        for opt in options {
            let opt = opt.as_ref();
            let (key, value) = opt.split_once('=').ok_or_else(|| {
                Error::config(opt, "override option must look like `key.path=value`")
            })?;
            let keys: Vec<&str> = key.split('.').collect();
            overrides::apply(&mut self.root, &keys, value)?;
        }
        Ok(())
    }

    /// Raw root value
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Top-level section by name, if present
    pub fn section(&self, name: &str) -> Option<&Value> {
        self.root.get(name)
    }

    /// Resolve a dot-separated path; numeric components index sequences.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut node = &self.root;
        for part in path.split('.') {
            node = match node {
                Value::Mapping(map) => map_get(map, part)?,
                Value::Sequence(seq) => seq.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(node)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.get(path).and_then(Value::as_i64)
    }

    pub fn get_usize(&self, path: &str) -> Option<usize> {
        self.get_i64(path).and_then(|v| usize::try_from(v).ok())
    }

    pub fn get_f64(&self, path: &str) -> Option<f64> {
        self.get(path).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    /// Integer with default; a present value of the wrong type is a
    /// configuration error, not a silent fallback.
    pub fn get_i64_or(&self, path: &str, default: i64) -> Result<i64> {
        match self.get(path) {
            None => Ok(default),
            Some(v) => v
                .as_i64()
                .ok_or_else(|| Error::config(path, "expected an integer")),
        }
    }

    pub fn get_usize_or(&self, path: &str, default: usize) -> Result<usize> {
        match self.get(path) {
            None => Ok(default),
            Some(v) => v
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| Error::config(path, "expected a non-negative integer")),
        }
    }

    pub fn get_f64_or(&self, path: &str, default: f64) -> Result<f64> {
        match self.get(path) {
            None => Ok(default),
            Some(v) => v
                .as_f64()
                .ok_or_else(|| Error::config(path, "expected a number")),
        }
    }

    pub fn get_bool_or(&self, path: &str, default: bool) -> Result<bool> {
        match self.get(path) {
            None => Ok(default),
            Some(v) => v
                .as_bool()
                .ok_or_else(|| Error::config(path, "expected a boolean")),
        }
    }

    /// String with default
    pub fn get_str_or(&self, path: &str, default: &str) -> Result<String> {
        match self.get(path) {
            None => Ok(default.to_string()),
            Some(v) => v
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::config(path, "expected a string")),
        }
    }

    /// Optional unsigned integer; present-but-negative is an error.
    pub fn get_u64_opt(&self, path: &str) -> Result<Option<u64>> {
        match self.get(path) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| Error::config(path, "expected a non-negative integer")),
        }
    }

    pub fn get_str_opt(&self, path: &str) -> Result<Option<String>> {
        match self.get(path) {
            None => Ok(None),
            Some(v) => v
                .as_str()
                .map(|s| Some(s.to_string()))
                .ok_or_else(|| Error::config(path, "expected a string")),
        }
    }

    /// Fetch a required value, reporting the missing key on failure
    pub fn require(&self, path: &str) -> Result<&Value> {
        self.get(path)
            .ok_or_else(|| Error::config(path, "required key is missing"))
    }
}
