//! Learning-rate schedules

use crate::config::Config;
use crate::{Error, Result};

/// Epoch-granularity learning-rate schedule.
///
/// Most schedules are a pure function of the epoch; plateau-style schedules
/// additionally consume the evaluation metric through `step_metric`.
pub trait LRScheduler {
    /// Learning rate to apply for `epoch` (1-based, matching the train loop).
    fn lr_for_epoch(&mut self, epoch: usize) -> f32;

    /// Feed an evaluation metric; a no-op for non-plateau schedules.
    fn step_metric(&mut self, _metric: f32) {}

    /// Whether this schedule reacts to `step_metric`.
    fn is_metric_driven(&self) -> bool {
        false
    }
}

/// Constant rate until each boundary epoch passes, then the next value.
pub struct Piecewise {
    boundaries: Vec<usize>,
    values: Vec<f32>,
}

impl Piecewise {
    pub fn new(boundaries: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        if values.len() != boundaries.len() + 1 {
            return Err(Error::config(
                "Optimizer.lr.values",
                format!(
                    "need {} values for {} boundaries, got {}",
                    boundaries.len() + 1,
                    boundaries.len(),
                    values.len()
                ),
            ));
        }
        if boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::config(
                "Optimizer.lr.boundaries",
                "boundaries must be strictly increasing",
            ));
        }
        Ok(Self { boundaries, values })
    }
}

impl LRScheduler for Piecewise {
    fn lr_for_epoch(&mut self, epoch: usize) -> f32 {
        let idx = self.boundaries.iter().take_while(|&&b| epoch >= b).count();
        self.values[idx]
    }
}

/// Half-cosine decay from the base rate down to `min_lr` over the run.
pub struct Cosine {
    base_lr: f32,
    min_lr: f32,
    epochs: usize,
}

impl Cosine {
    pub fn new(base_lr: f32, min_lr: f32, epochs: usize) -> Result<Self> {
        if epochs == 0 {
            return Err(Error::config("Optimizer.lr.epochs", "must be positive"));
        }
        if min_lr > base_lr {
            return Err(Error::config(
                "Optimizer.lr",
                format!("min_lr {min_lr} exceeds base lr {base_lr}"),
            ));
        }
        Ok(Self {
            base_lr,
            min_lr,
            epochs,
        })
    }
}

impl LRScheduler for Cosine {
    fn lr_for_epoch(&mut self, epoch: usize) -> f32 {
        let t = (epoch.saturating_sub(1).min(self.epochs - 1)) as f32 / self.epochs as f32;
        let cos = (std::f32::consts::PI * t).cos();
        self.min_lr + 0.5 * (self.base_lr - self.min_lr) * (1.0 + cos)
    }
}

/// Multiply the rate by `factor` when the watched metric stops improving
/// for `patience` consecutive observations.
pub struct ReduceOnPlateau {
    lr: f32,
    factor: f32,
    patience: usize,
    min_lr: f32,
    best: Option<f32>,
    bad_steps: usize,
}

impl ReduceOnPlateau {
    pub fn new(base_lr: f32, factor: f32, patience: usize, min_lr: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&factor) {
            return Err(Error::config(
                "Optimizer.lr.factor",
                format!("factor {factor} must be in (0, 1)"),
            ));
        }
        Ok(Self {
            lr: base_lr,
            factor,
            patience,
            min_lr,
            best: None,
            bad_steps: 0,
        })
    }
}

impl LRScheduler for ReduceOnPlateau {
    fn lr_for_epoch(&mut self, _epoch: usize) -> f32 {
        self.lr
    }

    fn step_metric(&mut self, metric: f32) {
        match self.best {
            Some(best) if metric <= best => {
                self.bad_steps += 1;
                if self.bad_steps > self.patience {
                    self.lr = (self.lr * self.factor).max(self.min_lr);
                    self.bad_steps = 0;
                }
            }
            _ => {
                self.best = Some(metric);
                self.bad_steps = 0;
            }
        }
    }

    fn is_metric_driven(&self) -> bool {
        true
    }
}

fn usize_list(config: &Config, key: &str) -> Result<Vec<usize>> {
    match config.get(key) {
        None => Ok(Vec::new()),
        Some(serde_yaml::Value::Sequence(seq)) => seq
            .iter()
            .map(|v| {
                v.as_u64()
                    .map(|n| n as usize)
                    .ok_or_else(|| Error::config(key, "expected non-negative integers"))
            })
            .collect(),
        Some(_) => Err(Error::config(key, "expected a list")),
    }
}

fn f32_list(config: &Config, key: &str) -> Result<Vec<f32>> {
    match config.get(key) {
        None => Ok(Vec::new()),
        Some(serde_yaml::Value::Sequence(seq)) => seq
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| Error::config(key, "expected numbers"))
            })
            .collect(),
        Some(_) => Err(Error::config(key, "expected a list")),
    }
}

/// Build the schedule from `Optimizer.lr_schedule`; absent config means a
/// constant rate (a trivial [`Piecewise`]).
pub fn build_scheduler(config: &Config, epochs: usize) -> Result<Box<dyn LRScheduler>> {
    let base_lr = config.get_f64_or("Optimizer.lr", 0.1)? as f32;
    let name = config.get_str_or("Optimizer.lr_schedule.name", "Constant")?;
    match name.as_str() {
        "Constant" => Ok(Box::new(Piecewise::new(Vec::new(), vec![base_lr])?)),
        "Piecewise" => {
            let boundaries = usize_list(config, "Optimizer.lr_schedule.boundaries")?;
            let mut values = f32_list(config, "Optimizer.lr_schedule.values")?;
            if values.is_empty() {
                values = vec![base_lr; boundaries.len() + 1];
            }
            Ok(Box::new(Piecewise::new(boundaries, values)?))
        }
        "Cosine" => {
            let min_lr = config.get_f64_or("Optimizer.lr_schedule.min_lr", 0.0)? as f32;
            Ok(Box::new(Cosine::new(base_lr, min_lr, epochs)?))
        }
        "ReduceOnPlateau" => {
            let factor = config.get_f64_or("Optimizer.lr_schedule.factor", 0.1)? as f32;
            let patience = config.get_usize_or("Optimizer.lr_schedule.patience", 2)?;
            let min_lr = config.get_f64_or("Optimizer.lr_schedule.min_lr", 0.0)? as f32;
            Ok(Box::new(ReduceOnPlateau::new(base_lr, factor, patience, min_lr)?))
        }
        other => Err(Error::config(
            "Optimizer.lr_schedule.name",
            format!("unknown schedule `{other}`"),
        )),
    }
}
