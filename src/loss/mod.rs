//! Loss construction and composition
//!
//! The `Loss` trait is the single seam the training loop sees: every loss,
//! plain or distillation-wrapped, maps a (possibly nested) model output plus
//! a batch to an ordered dictionary of named scalar terms. `build_loss`
//! instantiates the configured list through a closed name registry and wraps
//! it in a [`CombinedLoss`] that weights and merges the terms.

mod at;
mod contrastive;
mod cross_entropy;
mod dict;
mod distance;
mod distillation;
mod dml;
pub mod functional;
mod kldiv;
mod rkd;

pub use at::ATLoss;
pub use contrastive::ContrastiveLoss;
pub use cross_entropy::{CELoss, TargetRef};
pub use dict::LossDict;
pub use distance::{DistanceLoss, DistanceMode};
pub use distillation::{
    DistillationATLoss, DistillationCELoss, DistillationDMLLoss, DistillationDistanceLoss,
    DistillationGTCELoss, DistillationGuidedKLDivLoss, DistillationKLDivLoss,
    DistillationRKDLoss, KLDivKeySelect, ModelNamePairs,
};
pub use dml::DMLLoss;
pub use kldiv::KLDivLoss;
pub use rkd::{RkdAngle, RkdDistance};

use crate::arch::ModelOutput;
use crate::config::Config;
use crate::data::Batch;
use crate::{Error, Result};
use serde_yaml::{Mapping, Value};

/// Named loss over a model-output structure and one batch.
pub trait Loss {
    fn name(&self) -> &str;

    fn forward(&self, predicts: &ModelOutput, batch: &Batch) -> Result<LossDict>;

    /// Embedding width this loss expects, when it feeds a feature cache.
    fn feat_dim_hint(&self) -> Option<usize> {
        None
    }
}

/// Weighted composition of configured losses.
///
/// The merged dictionary carries every member's re-keyed terms (weighted)
/// plus a `loss` headline term holding their sum.
pub struct CombinedLoss {
    entries: Vec<(Box<dyn Loss>, f32)>,
}

impl std::fmt::Debug for CombinedLoss {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombinedLoss")
            .field("len", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl CombinedLoss {
    pub fn new(entries: Vec<(Box<dyn Loss>, f32)>) -> Result<Self> {
        if entries.is_empty() {
            return Err(Error::config("Loss", "at least one loss must be configured"));
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The embedding width of a configured contrastive member, if any; the
    /// engine uses it to size the cross-batch memory.
    pub fn contrastive_feat_dim(&self) -> Option<usize> {
        self.entries.iter().find_map(|(l, _)| l.feat_dim_hint())
    }

    pub fn forward(&self, predicts: &ModelOutput, batch: &Batch) -> Result<LossDict> {
        let mut out = LossDict::new();
        let mut total = 0.0;
        for (loss, weight) in &self.entries {
            let terms = loss.forward(predicts, batch)?;
            total += terms.sum() * weight;
            out.merge_weighted(terms, *weight)?;
        }
        out.insert("loss", total)?;
        Ok(out)
    }
}

fn map_get<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

fn get_f32_or(map: &Mapping, who: &str, key: &str, default: f32) -> Result<f32> {
    match map_get(map, key) {
        None => Ok(default),
        Some(v) => v
            .as_f64()
            .map(|f| f as f32)
            .ok_or_else(|| Error::config(format!("{who}.{key}"), "expected a number")),
    }
}

fn get_str(map: &Mapping, who: &str, key: &str) -> Result<Option<String>> {
    match map_get(map, key) {
        None => Ok(None),
        Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| Error::config(format!("{who}.{key}"), "expected a string")),
    }
}

fn string_list(map: &Mapping, who: &str, key: &str) -> Result<Vec<String>> {
    match map_get(map, key) {
        None => Ok(Vec::new()),
        Some(Value::Sequence(seq)) => seq
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::config(format!("{who}.{key}"), "expected strings"))
            })
            .collect(),
        Some(_) => Err(Error::config(
            format!("{who}.{key}"),
            "expected a list of strings",
        )),
    }
}

fn name_pairs(map: &Mapping, who: &str) -> Result<ModelNamePairs> {
    let Some(value) = map_get(map, "model_name_pairs") else {
        return Ok(vec![("Student".to_string(), "Teacher".to_string())]);
    };
    let seq = value.as_sequence().ok_or_else(|| {
        Error::config(format!("{who}.model_name_pairs"), "expected a list of pairs")
    })?;
    seq.iter()
        .map(|pair| {
            let pair = pair.as_sequence().filter(|p| p.len() == 2).ok_or_else(|| {
                Error::config(
                    format!("{who}.model_name_pairs"),
                    "each pair must be a two-element list",
                )
            })?;
            match (pair[0].as_str(), pair[1].as_str()) {
                (Some(a), Some(b)) => Ok((a.to_string(), b.to_string())),
                _ => Err(Error::config(
                    format!("{who}.model_name_pairs"),
                    "pair members must be strings",
                )),
            }
        })
        .collect()
}

fn build_one(name: &str, params: &Mapping) -> Result<Box<dyn Loss>> {
    match name {
        "CELoss" => {
            let epsilon = match map_get(params, "epsilon") {
                None | Some(Value::Null) => None,
                Some(v) => Some(v.as_f64().map(|f| f as f32).ok_or_else(|| {
                    Error::config("CELoss.epsilon", "expected a number")
                })?),
            };
            Ok(Box::new(CELoss::new(epsilon)?))
        }
        "ContrastiveLoss" => {
            let margin = get_f32_or(params, name, "margin", 0.5)?;
            let feat_dim = match map_get(params, "feat_dim") {
                None => 64,
                Some(v) => v.as_u64().ok_or_else(|| {
                    Error::config("ContrastiveLoss.feat_dim", "expected a positive integer")
                })? as usize,
            };
            Ok(Box::new(ContrastiveLoss::new(margin, feat_dim)?))
        }
        "DistillationCELoss" => Ok(Box::new(DistillationCELoss::new(
            CELoss::new(None)?,
            name_pairs(params, name)?,
            get_str(params, name, "key")?,
        )?)),
        "DistillationGTCELoss" => {
            let mut names = string_list(params, name, "model_names")?;
            if names.is_empty() {
                names = vec!["Student".to_string()];
            }
            Ok(Box::new(DistillationGTCELoss::new(
                CELoss::new(None)?,
                names,
                get_str(params, name, "key")?,
            )?))
        }
        "DistillationDMLLoss" => Ok(Box::new(DistillationDMLLoss::new(
            DMLLoss::new(),
            name_pairs(params, name)?,
            get_str(params, name, "key")?,
        )?)),
        "DistillationDistanceLoss" => {
            let mode: DistanceMode = get_str(params, name, "mode")?
                .unwrap_or_else(|| "l2".to_string())
                .parse()?;
            let base = DistanceLoss::new(mode);
            let adapter_name = format!(
                "{}{}",
                get_str(params, name, "name")?.unwrap_or_else(|| "loss_".to_string()),
                match mode {
                    DistanceMode::L1 => "l1",
                    DistanceMode::L2 => "l2",
                    DistanceMode::SmoothL1 => "smooth_l1",
                }
            );
            Ok(Box::new(DistillationDistanceLoss::new(
                base,
                adapter_name,
                name_pairs(params, name)?,
                get_str(params, name, "key")?,
            )?))
        }
        "DistillationRKDLoss" => Ok(Box::new(DistillationRKDLoss::new(
            name_pairs(params, name)?,
            string_list(params, name, "student_keepkeys")?,
            string_list(params, name, "teacher_keepkeys")?,
        )?)),
        "DistillationKLDivLoss" => {
            let temperature = get_f32_or(params, name, "temperature", 4.0)?;
            let mode = get_str(params, name, "mode")?;
            let select = if mode.as_deref() == Some("attention") {
                let keys = string_list(params, name, "key")?;
                if keys.len() != 2 {
                    return Err(Error::config(
                        "DistillationKLDivLoss.key",
                        "attention mode needs exactly two output keys",
                    ));
                }
                KLDivKeySelect::Attention(keys[0].clone(), keys[1].clone())
            } else {
                KLDivKeySelect::Pairwise(get_str(params, name, "key")?)
            };
            Ok(Box::new(DistillationKLDivLoss::new(
                KLDivLoss::new(temperature)?,
                name_pairs(params, name)?,
                select,
            )?))
        }
        "DistillationATLoss" => {
            let p = get_f32_or(params, name, "p", 2.0)? as i32;
            Ok(Box::new(DistillationATLoss::new(
                ATLoss::new(p)?,
                name_pairs(params, name)?,
                string_list(params, name, "student_keys")?,
                string_list(params, name, "teacher_keys")?,
                get_str(params, name, "mode")?.as_deref() == Some("attention"),
            )?))
        }
        "DistillationGuidedKLDivLoss" => Ok(Box::new(DistillationGuidedKLDivLoss::new(
            name_pairs(params, name)?,
            get_f32_or(params, name, "temperature", 4.0)?,
            get_str(params, name, "key")?,
        )?)),
        other => Err(Error::config(
            "Loss",
            format!("unknown loss `{other}`"),
        )),
    }
}

/// Build the combined loss from a config section such as `Loss.Train`: an
/// ordered list of single-key mappings, each carrying a `weight` plus the
/// loss's own parameters.
pub fn build_loss(config: &Config, section: &str) -> Result<CombinedLoss> {
    let value = config
        .get(section)
        .ok_or_else(|| Error::config(section, "loss section is missing"))?;
    let seq = value
        .as_sequence()
        .ok_or_else(|| Error::config(section, "loss config should be a list"))?;
    let mut entries = Vec::with_capacity(seq.len());
    for item in seq {
        let map = item
            .as_mapping()
            .filter(|m| m.len() == 1)
            .ok_or_else(|| Error::config(section, "each loss entry must have exactly one key"))?;
        let (name, params) = map.iter().next().expect("checked len == 1");
        let name = name
            .as_str()
            .ok_or_else(|| Error::config(section, "loss name must be a string"))?;
        let params = match params {
            Value::Null => Mapping::new(),
            Value::Mapping(m) => m.clone(),
            _ => {
                return Err(Error::config(
                    name,
                    "loss parameters must be a mapping or null",
                ))
            }
        };
        let weight = get_f32_or(&params, name, "weight", 1.0)?;
        entries.push((build_one(name, &params)?, weight));
    }
    CombinedLoss::new(entries)
}
