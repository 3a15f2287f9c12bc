//! Pipeline assembly and operator fusion
//!
//! Walks the ordered operator spec list once, replacing recognized adjacent
//! patterns with their fused kernels. Each emission is logged so the final
//! pipeline can be audited against the config.

use super::convert::{convert_op, convert_spec};
use super::ops::{CompiledOp, DaliOpKind, Device};
use super::OpSpec;
use crate::Result;
use serde_yaml::{Mapping, Value};

/// Merge parameter mappings in order; a later mapping wins on key conflicts.
fn merge_params(parts: &[&Mapping]) -> Mapping {
    let mut out = Mapping::new();
    for part in parts {
        for (k, v) in part.iter() {
            // Mapping::insert replaces an existing key in place
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

fn log_fused(pattern: &str, op: &CompiledOp) {
    println!("operator conversion: {pattern} -> {op:?}");
}

/// Compile an operator spec list into device-bound operators.
///
/// With `enable_fuse` set, three adjacency patterns collapse into fused
/// kernels; otherwise every spec compiles one-to-one and a trailing
/// `ToCHWImage` is appended when the list lacks one.
pub fn build_transforms(
    specs: &[OpSpec],
    device: Device,
    enable_fuse: bool,
) -> Result<Vec<CompiledOp>> {
    let mut specs = specs.to_vec();
    if !enable_fuse && !specs.iter().any(|s| s.name == "ToCHWImage") {
        specs.push(OpSpec::new("ToCHWImage", Mapping::new()));
    }

    let mut ops = Vec::with_capacity(specs.len());
    let mut idx = 0;
    while idx < specs.len() {
        let cur = &specs[idx];
        if enable_fuse {
            if let Some((op, pattern)) = try_fuse(&specs, idx, device)? {
                log_fused(pattern, &op);
                ops.push(op);
                idx += 2;
                continue;
            }
        }
        let op = convert_spec(cur, device)?;
        println!("operator conversion: {} -> {op:?}", cur.name);
        ops.push(op);
        idx += 1;
    }
    Ok(ops)
}

/// Check the fusion patterns at `idx`; a hit always consumes the current and
/// next spec (the flip-normalize pattern additionally folds in the already
/// emitted crop's parameters).
fn try_fuse(
    specs: &[OpSpec],
    idx: usize,
    device: Device,
) -> Result<Option<(CompiledOp, &'static str)>> {
    let cur = &specs[idx];
    let Some(nxt) = specs.get(idx + 1) else {
        return Ok(None);
    };

    if cur.name == "DecodeImage" && nxt.name == "RandCropImage" {
        let merged = merge_params(&[&cur.params, &nxt.params]);
        // the merged crop size may be a pair; the fused kernel wants a scalar
        let merged = scalarize_size(merged);
        let op = convert_op(DaliOpKind::DecodeRandomResizedCrop, device, &merged)?;
        return Ok(Some((op, "[DecodeImage, RandCropImage]")));
    }

    if idx > 0
        && specs[idx - 1].name == "RandCropImage"
        && cur.name == "RandFlipImage"
        && nxt.name == "NormalizeImage"
    {
        let merged = merge_params(&[&cur.params, &specs[idx - 1].params, &nxt.params]);
        let op = convert_op(DaliOpKind::CropMirrorNormalize, device, &merged)?;
        return Ok(Some((op, "[RandCropImage, RandFlipImage, NormalizeImage]")));
    }

    if cur.name == "CropImage" && nxt.name == "NormalizeImage" {
        let mut merged = merge_params(&[&cur.params, &nxt.params]);
        merged.insert(Value::from("prob"), Value::from(0.0));
        let op = convert_op(DaliOpKind::CropMirrorNormalize, device, &merged)?;
        return Ok(Some((op, "[CropImage, NormalizeImage]")));
    }

    Ok(None)
}

/// Reduce a two-element `size` list to its first element so the fused decode
/// kernel gets the square resize it expects.
fn scalarize_size(mut map: Mapping) -> Mapping {
    let scalar = match map.iter().find(|(k, _)| k.as_str() == Some("size")) {
        Some((_, Value::Sequence(seq))) if !seq.is_empty() => Some(seq[0].clone()),
        _ => None,
    };
    if let Some(v) = scalar {
        map.insert(Value::from("size"), v);
    }
    map
}
