//! Crate-wide error taxonomy
//!
//! Construction-time problems (bad mode, unknown operator, missing file) are
//! fatal and abort the run before any partial engine is usable. Per-step
//! numeric degeneracies surface as `DegenerateBatch` so callers apply an
//! explicit policy instead of propagating NaNs.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the orchestration core
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration value. Carries the offending key so the user
    /// can locate it in the YAML tree.
    #[error("invalid configuration for `{key}`: {message}")]
    Config { key: String, message: String },

    /// A file or directory required before use does not exist
    #[error("resource not found: {}", .0.display())]
    ResourceMissing(PathBuf),

    /// A batch-level numeric degeneracy (zero samples, empty buffers)
    #[error("degenerate batch: {0}")]
    DegenerateBatch(String),

    /// Two loss terms produced the same composite key. This is a
    /// configuration defect (duplicate model pairs), surfaced loudly
    /// instead of silently overwriting one term.
    #[error("loss term key collision: `{0}`")]
    LossKeyCollision(String),

    /// Checkpoint or export (de)serialization failure
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Underlying filesystem failure
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Shorthand for a configuration error at `key`
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
