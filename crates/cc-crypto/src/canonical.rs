//! Deterministic JSON serialization for anything that gets signed.
//!
//! `serde_json::Value`'s map type is a `BTreeMap` as long as the
//! `preserve_order` feature is not enabled (it is not, here), so converting a
//! value to `serde_json::Value` and serializing that sorts every object's
//! keys lexicographically at every nesting level. Combined with
//! `to_string` (no pretty-printing, no extra whitespace) this gives both
//! sides of a signature bit-identical bytes.

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum CanonicalError {
    #[error("failed to serialize value: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonicalError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&v)?)
}

pub fn canonical_json_string<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_at_every_level() {
        let value = json!({"b": 1, "a": {"z": 1, "y": 2}, "c": 3});
        let bytes = canonical_json_bytes(&value).unwrap();
        let s = String::from_utf8(bytes).unwrap();
        assert_eq!(s, r#"{"a":{"y":2,"z":1},"b":1,"c":3}"#);
    }

    #[test]
    fn is_deterministic_across_calls() {
        let value = json!({"z": 1, "a": 2, "m": [3, 2, 1]});
        let first = canonical_json_bytes(&value).unwrap();
        let second = canonical_json_bytes(&value).unwrap();
        assert_eq!(first, second);
    }
}
