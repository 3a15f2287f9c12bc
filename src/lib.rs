//! Configuration-driven training and evaluation orchestration for image
//! classification.
//!
//! One YAML configuration drives the whole run: the [`engine::Engine`] is
//! built for exactly one mode (train, eval, infer, export) and wires
//! dataloaders, model, losses, metrics, optimizer, mixed precision, EMA
//! and checkpointing from it.
//!
//! # Example
//!
//! ```no_run
//! use clasificar::config::Config;
//! use clasificar::engine::{EngineBuilder, Mode};
//!
//! # fn main() -> clasificar::Result<()> {
//! let mut config = Config::from_file("config.yaml")?;
//! config.apply_overrides(&["Optimizer.lr=0.01"])?;
//! let mut engine = EngineBuilder::new(config, Mode::Train).build()?;
//! engine.train()?;
//! # Ok(())
//! # }
//! ```

pub mod arch;
pub mod config;
pub mod dali;
pub mod data;
pub mod ema;
pub mod engine;
pub mod error;
pub mod io;
pub mod loss;
pub mod memory;
pub mod metric;
pub mod optim;

pub use error::{Error, Result};
