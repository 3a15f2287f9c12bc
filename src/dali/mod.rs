//! Declarative preprocessing-pipeline compiler
//!
//! Translates an ordered list of abstract preprocessing operator specs (the
//! `transform_ops` YAML contract) into concrete, device-bound operator
//! descriptions, optionally fusing adjacent operators into single
//! higher-throughput kernels:
//!
//! - `DecodeImage + RandCropImage` -> `DecodeRandomResizedCrop`
//! - `RandCropImage, RandFlipImage, NormalizeImage` -> `CropMirrorNormalize`
//! - `CropImage + NormalizeImage` -> `CropMirrorNormalize` (flip disabled)
//!
//! Operator names form a closed registry; an unknown name is a configuration
//! error at compile time, never a silent skip.
//!
//! # Example
//!
//! ```
//! use clasificar::dali::{build_transforms, parse_transform_spec, DaliOpKind, Device};
//!
//! let spec = serde_yaml::from_str(
//!     "- DecodeImage:\n    to_rgb: true\n- RandCropImage:\n    size: 224\n",
//! )
//! .unwrap();
//! let ops = build_transforms(&parse_transform_spec(&spec).unwrap(), Device::Gpu, true).unwrap();
//! assert_eq!(ops.len(), 1);
//! assert_eq!(ops[0].kind(), DaliOpKind::DecodeRandomResizedCrop);
//! ```

mod convert;
mod fuse;
mod ops;
mod params;

pub use convert::convert_op;
pub use fuse::build_transforms;
pub use ops::{
    ChannelOrder, ColorJitterParams, CompiledOp, CropMirrorNormalizeParams, CropParams,
    DaliOpKind, DecodeParams, DecodeRandResizedCropParams, Device, ImageType, Interp,
    NormalizeParams, PadParams, Placement, RandCropV2Params, RandFlipParams, RandResizedCropParams,
    RandomCropParams, RandomRot90Params, RandomRotationParams, ResizeParams, ToChwParams,
};

use crate::{Error, Result};
use serde_yaml::{Mapping, Value};

/// One abstract operator spec: a name plus its raw parameter mapping.
///
/// The on-disk form is a single-key mapping (`- ResizeImage: {size: 224}`);
/// order within the list is execution order.
#[derive(Debug, Clone)]
pub struct OpSpec {
    pub name: String,
    pub params: Mapping,
}

impl OpSpec {
    pub fn new(name: impl Into<String>, params: Mapping) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// Parse one entry of the `transform_ops` list.
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value.as_mapping().ok_or_else(|| {
            Error::config("transform_ops", "each operator entry must be a mapping")
        })?;
        if map.len() != 1 {
            return Err(Error::config(
                "transform_ops",
                format!("operator entry must have exactly one key, got {}", map.len()),
            ));
        }
        let (name, params) = map.iter().next().expect("checked len == 1");
        let name = name
            .as_str()
            .ok_or_else(|| Error::config("transform_ops", "operator name must be a string"))?;
        let params = match params {
            Value::Null => Mapping::new(),
            Value::Mapping(m) => m.clone(),
            _ => {
                return Err(Error::config(
                    name,
                    "operator parameters must be a mapping or null",
                ))
            }
        };
        Ok(Self::new(name, params))
    }
}

/// Parse a whole `transform_ops` sequence.
pub fn parse_transform_spec(value: &Value) -> Result<Vec<OpSpec>> {
    let seq = value
        .as_sequence()
        .ok_or_else(|| Error::config("transform_ops", "operator config should be a list"))?;
    seq.iter().map(OpSpec::from_value).collect()
}
