//! Canonical JSON rendering and content digests.
//!
//! Recipes, templates and pipeline definitions are compared and hashed in
//! canonical form: object keys sorted by UTF-16 code units, integer-valued
//! floats written as integers, no insignificant whitespace. Array order is
//! preserved since it is meaningful (component install order, stage order).

use serde::Serialize;
use serde_json::{Map, Number, Value};
use ueps_state::ContentDigest;

use crate::domain::error::{Result, UepsError};

fn canonicalize(value: &Value) -> Result<Value> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key.as_str()])?);
            }
            Ok(Value::Object(sorted))
        }
        Value::Array(items) => Ok(Value::Array(
            items.iter().map(canonicalize).collect::<Result<Vec<_>>>()?,
        )),
        Value::Number(n) if !(n.is_i64() || n.is_u64()) => {
            let Some(f) = n.as_f64() else {
                return Ok(value.clone());
            };
            if !f.is_finite() {
                return Err(UepsError::Config(
                    "NaN/Infinity not permitted in canonical JSON".to_string(),
                ));
            }
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                Ok(Value::Number(Number::from(f as i64)))
            } else {
                Ok(value.clone())
            }
        }
        other => Ok(other.clone()),
    }
}

/// Render a JSON value in canonical form.
pub fn canonical_json(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(&canonicalize(value)?)?)
}

/// Serialize any value and render it in canonical form.
pub fn to_canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    canonical_json(&serde_json::to_value(value)?)
}

/// SHA-256 digest of the canonical JSON form of `value`.
pub fn compute_digest<T: Serialize + ?Sized>(value: &T) -> Result<ContentDigest> {
    let canonical = to_canonical_json(value)?;
    Ok(ContentDigest::from_bytes(canonical.as_bytes()))
}
