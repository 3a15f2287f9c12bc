//! Mixed-precision configuration

use crate::config::Config;
use crate::Result;

/// Supported AMP optimization levels. Anything else in the config is
/// corrected to O1 with a warning rather than failing the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmpLevel {
    O1,
    O2,
}

/// Resolved mixed-precision settings for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct AmpConfig {
    pub level: AmpLevel,
    pub use_fp16_test: bool,
    pub scale_loss: f32,
}

impl AmpConfig {
    /// Read the `AMP` config section; returns `None` when absent.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        if config.get("AMP").is_none() {
            return Ok(None);
        }
        let raw_level = config.get_str_or("AMP.level", "O1")?;
        let level = match raw_level.as_str() {
            "O1" => AmpLevel::O1,
            "O2" => AmpLevel::O2,
            other => {
                println!("warning: AMP.level `{other}` is not in [O1, O2], falling back to O1");
                AmpLevel::O1
            }
        };
        let mut use_fp16_test = config.get_bool_or("AMP.use_fp16_test", false)?;
        // pure-fp16 weights make fp32 evaluation meaningless
        if level == AmpLevel::O2 && !use_fp16_test {
            println!("warning: AMP O2 requires fp16 evaluation, forcing use_fp16_test=true");
            use_fp16_test = true;
        }
        let scale_loss = config.get_f64_or("AMP.scale_loss", 65536.0)? as f32;
        Ok(Some(Self {
            level,
            use_fp16_test,
            scale_loss,
        }))
    }
}

/// Static loss scaler: scales the loss before backward and unscales
/// gradients before the optimizer step.
#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f32,
}

impl LossScaler {
    pub fn new(scale: f32) -> Self {
        Self {
            scale: scale.max(1.0),
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn unscale(&self, grad: f32) -> f32 {
        grad / self.scale
    }
}
