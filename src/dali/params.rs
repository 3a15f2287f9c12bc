//! Raw parameter-mapping accessors
//!
//! Operator specs arrive as untyped YAML mappings; these helpers pull typed
//! values out with op-specific defaulting and report the offending key on a
//! type mismatch.

use crate::{Error, Result};
use serde_yaml::{Mapping, Value};

pub(crate) fn get<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

fn type_err(op: &str, key: &str, expected: &str) -> Error {
    Error::config(format!("{op}.{key}"), format!("expected {expected}"))
}

pub(crate) fn get_bool_or(map: &Mapping, op: &str, key: &str, default: bool) -> Result<bool> {
    match get(map, key) {
        None => Ok(default),
        Some(v) => v.as_bool().ok_or_else(|| type_err(op, key, "a bool")),
    }
}

pub(crate) fn get_i64(map: &Mapping, op: &str, key: &str) -> Result<Option<i64>> {
    match get(map, key) {
        None => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| type_err(op, key, "an integer")),
    }
}

pub(crate) fn get_i64_or(map: &Mapping, op: &str, key: &str, default: i64) -> Result<i64> {
    Ok(get_i64(map, op, key)?.unwrap_or(default))
}

pub(crate) fn get_f32(map: &Mapping, op: &str, key: &str) -> Result<Option<f32>> {
    match get(map, key) {
        None => Ok(None),
        Some(v) => v
            .as_f64()
            .map(|f| Some(f as f32))
            .ok_or_else(|| type_err(op, key, "a number")),
    }
}

pub(crate) fn get_f32_or(map: &Mapping, op: &str, key: &str, default: f32) -> Result<f32> {
    Ok(get_f32(map, op, key)?.unwrap_or(default))
}

pub(crate) fn get_str<'a>(map: &'a Mapping, op: &str, key: &str) -> Result<Option<&'a str>> {
    match get(map, key) {
        None => Ok(None),
        Some(v) => v
            .as_str()
            .map(Some)
            .ok_or_else(|| type_err(op, key, "a string")),
    }
}

/// A size-like value: a scalar repeats into `(v, v)`, a two-element list
/// maps to `(list[0], list[1])`.
pub(crate) fn get_pair(map: &Mapping, op: &str, key: &str) -> Result<Option<(i64, i64)>> {
    match get(map, key) {
        None => Ok(None),
        Some(Value::Sequence(seq)) => {
            if seq.len() != 2 {
                return Err(type_err(op, key, "a scalar or a two-element list"));
            }
            let a = seq[0].as_i64().ok_or_else(|| type_err(op, key, "integers"))?;
            let b = seq[1].as_i64().ok_or_else(|| type_err(op, key, "integers"))?;
            Ok(Some((a, b)))
        }
        Some(v) => {
            let n = v
                .as_i64()
                .ok_or_else(|| type_err(op, key, "a scalar or a two-element list"))?;
            Ok(Some((n, n)))
        }
    }
}

/// A two-element float range, e.g. `scale: [0.08, 1.0]`.
pub(crate) fn get_range_or(
    map: &Mapping,
    op: &str,
    key: &str,
    default: (f32, f32),
) -> Result<(f32, f32)> {
    match get(map, key) {
        None => Ok(default),
        Some(Value::Sequence(seq)) if seq.len() == 2 => {
            let a = seq[0].as_f64().ok_or_else(|| type_err(op, key, "numbers"))?;
            let b = seq[1].as_f64().ok_or_else(|| type_err(op, key, "numbers"))?;
            Ok((a as f32, b as f32))
        }
        Some(_) => Err(type_err(op, key, "a two-element list")),
    }
}

pub(crate) fn get_f32_list_or(
    map: &Mapping,
    op: &str,
    key: &str,
    default: &[f32],
) -> Result<Vec<f32>> {
    match get(map, key) {
        None => Ok(default.to_vec()),
        Some(Value::Sequence(seq)) => seq
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| type_err(op, key, "numbers"))
            })
            .collect(),
        Some(_) => Err(type_err(op, key, "a list of numbers")),
    }
}

/// Scale factors may be written as a number or a fraction string such as
/// `"1.0/255.0"` (the on-disk config convention).
pub(crate) fn get_scale_or(map: &Mapping, op: &str, key: &str, default: f32) -> Result<f32> {
    match get(map, key) {
        None => Ok(default),
        Some(v) => {
            if let Some(f) = v.as_f64() {
                return Ok(f as f32);
            }
            let s = v
                .as_str()
                .ok_or_else(|| type_err(op, key, "a number or fraction string"))?;
            if let Some((num, den)) = s.split_once('/') {
                let num: f32 = num
                    .trim()
                    .parse()
                    .map_err(|_| type_err(op, key, "a number or fraction string"))?;
                let den: f32 = den
                    .trim()
                    .parse()
                    .map_err(|_| type_err(op, key, "a number or fraction string"))?;
                if den == 0.0 {
                    return Err(type_err(op, key, "a non-zero denominator"));
                }
                Ok(num / den)
            } else {
                s.trim()
                    .parse()
                    .map_err(|_| type_err(op, key, "a number or fraction string"))
            }
        }
    }
}
