//! Dot-path override merging
//!
//! Implements the `key0.key1.idx.key2=value` override syntax. Values are
//! parsed through YAML so `lr=0.01` becomes a float and `use_dali=true` a
//! bool; anything unparseable stays a string.

use crate::{Error, Result};
use serde_yaml::{Mapping, Value};

/// Parse a raw override value as a YAML scalar, falling back to a string.
pub fn parse_scalar(raw: &str) -> Value {
    serde_yaml::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn map_get_mut<'a>(map: &'a mut Mapping, key: &str) -> Option<&'a mut Value> {
    map.iter_mut()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

/// Recursively apply one override to `node`.
pub(super) fn apply(node: &mut Value, keys: &[&str], raw: &str) -> Result<()> {
    debug_assert!(!keys.is_empty());
    match node {
        Value::Sequence(seq) => {
            let idx: usize = keys[0].parse().map_err(|_| {
                Error::config(keys[0], "expected a numeric index into a sequence")
            })?;
            let len = seq.len();
            let slot = seq.get_mut(idx).ok_or_else(|| {
                Error::config(keys[0], format!("index {idx} out of range ({len} elements)"))
            })?;
            if keys.len() == 1 {
                *slot = parse_scalar(raw);
                Ok(())
            } else {
                apply(slot, &keys[1..], raw)
            }
        }
        Value::Mapping(map) => {
            if keys.len() == 1 {
                if map_get_mut(map, keys[0]).is_none() {
                    println!("config override: new field `{}` created", keys[0]);
                }
                map.insert(Value::String(keys[0].to_string()), parse_scalar(raw));
                Ok(())
            } else {
                if map_get_mut(map, keys[0]).is_none() {
                    println!("config override: new section `{}` created", keys[0]);
                    map.insert(
                        Value::String(keys[0].to_string()),
                        Value::Mapping(Mapping::new()),
                    );
                }
                let child = map_get_mut(map, keys[0]).expect("section just inserted");
                apply(child, &keys[1..], raw)
            }
        }
        _ => Err(Error::config(
            keys[0],
            "cannot descend into a scalar config value",
        )),
    }
}
