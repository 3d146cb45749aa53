//! Canonical JSON encoding and SHA-256 hashing.
//!
//! Every hash in the runtime (params, outputs, entries, idempotency keys,
//! fingerprints) goes through [`canonical_encode`], so two semantically equal
//! values hash identically regardless of key insertion order, process, or
//! platform.
//!
//! Canonical form: object keys sorted by their UTF-8 bytes, no insignificant
//! whitespace, strings escaped by `serde_json`, numbers rendered by
//! `serde_json` (shortest round-trip form for floats).

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Number of digest bytes kept for step ids (32 hex chars).
const STEP_ID_BYTES: usize = 16;

/// Encode `value` into canonical JSON bytes.
pub fn canonical_encode<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(canonical_value_bytes(&value))
}

/// Canonical JSON as a `String` (handy for diagnostics and tests).
pub fn canonical_string<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_value(&value, &mut out);
    Ok(out)
}

/// SHA-256 (lowercase hex) of the canonical encoding of `value`.
pub fn hash_value<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    Ok(sha256_hex(&canonical_encode(value)?))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Deterministic step id for `(execution_id, execution_order, intent, tool_name)`.
///
/// Never random: the same logical step in a re-run of the same execution gets
/// the same id, which is what lets recovery match started and committed
/// entries across process restarts.
pub fn step_id(execution_id: &str, execution_order: u32, intent: &str, tool_name: &str) -> String {
    let key = serde_json::json!([execution_id, execution_order, intent, tool_name]);
    let mut hasher = Sha256::new();
    hasher.update(canonical_value_bytes(&key));
    let digest = hasher.finalize();
    hex::encode(&digest[..STEP_ID_BYTES])
}

/// Idempotency key for a step invocation.
pub fn idempotency_key(
    execution_id: &str,
    intent: &str,
    tool_name: &str,
    params_hash: &str,
    execution_order: u32,
) -> String {
    let key = serde_json::json!([execution_id, intent, tool_name, params_hash, execution_order]);
    sha256_hex(&canonical_value_bytes(&key))
}

/// Canonical bytes of an already-built `Value` (infallible).
pub fn canonical_value_bytes(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_value(value, &mut out);
    out.into_bytes()
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                if let Some(item) = map.get(key) {
                    write_value(item, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
    }
}

fn write_string(s: &str, out: &mut String) {
    // `Value::String` display is the serde_json-escaped literal.
    out.push_str(&Value::String(s.to_owned()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    #[test]
    fn keys_are_sorted_and_whitespace_free() {
        let encoded = canonical_string(&json!({"b": 1, "a": {"d": [1, 2], "c": null}}))
            .expect("encode");
        assert_eq!(encoded, r#"{"a":{"c":null,"d":[1,2]},"b":1}"#);
    }

    #[test]
    fn insertion_order_does_not_change_hash() {
        let mut first = Map::new();
        first.insert("zeta".to_string(), json!("z"));
        first.insert("alpha".to_string(), json!({"y": 2, "x": 1}));
        let mut second = Map::new();
        second.insert("alpha".to_string(), json!({"x": 1, "y": 2}));
        second.insert("zeta".to_string(), json!("z"));

        assert_eq!(
            hash_value(&first).expect("hash"),
            hash_value(&second).expect("hash")
        );
    }

    #[test]
    fn different_values_hash_differently() {
        let a = hash_value(&json!({"key": "value"})).expect("hash");
        let b = hash_value(&json!({"key": "other"})).expect("hash");
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn full_precision_floats_survive_reparse() {
        let floats = crate::test_support::full_precision_floats(4_000);
        for chunk in floats.chunks(100) {
            let original = json!({ "xs": chunk });
            let encoded = canonical_string(&original).expect("encode");
            let reparsed: Value = serde_json::from_str(&encoded).expect("parse");
            assert_eq!(reparsed, original, "{encoded}");
            assert_eq!(canonical_string(&reparsed).expect("encode"), encoded);
        }
        let score = json!({"score": 0.10957860598549463_f64});
        let reparsed: Value = serde_json::from_str(&score.to_string()).expect("parse");
        assert_eq!(hash_value(&reparsed).expect("hash"), hash_value(&score).expect("hash"));
    }

    #[test]
    fn unicode_and_escapes_survive() {
        let encoded = canonical_string(&json!({"k": "line\n\"quoted\" é"})).expect("encode");
        assert_eq!(encoded, "{\"k\":\"line\\n\\\"quoted\\\" é\"}");
    }

    #[test]
    fn step_id_is_deterministic_and_order_sensitive() {
        let first = step_id("e1", 1, "fetch", "fetch_context");
        assert_eq!(first, step_id("e1", 1, "fetch", "fetch_context"));
        assert_eq!(first.len(), 32);
        assert_ne!(first, step_id("e1", 2, "fetch", "fetch_context"));
        assert_ne!(first, step_id("e2", 1, "fetch", "fetch_context"));
    }

    #[test]
    fn idempotency_key_is_stable() {
        let params_hash = hash_value(&json!({"key": "value"})).expect("hash");
        let a = idempotency_key("e1", "update", "db_update", &params_hash, 2);
        let b = idempotency_key("e1", "update", "db_update", &params_hash, 2);
        assert_eq!(a, b);
        assert_ne!(a, idempotency_key("e1", "update", "db_update", &params_hash, 3));
    }
}
