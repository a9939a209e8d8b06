//! Canonical forms of request payloads.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Field names that change between otherwise identical requests.
pub const DEFAULT_VOLATILE_FIELDS: &[&str] = &[
    "_",
    "nonce",
    "_nonce",
    "_wpnonce",
    "timestamp",
    "_timestamp",
    "request_id",
    "_request_id",
];

/// Rebuilds `value` with object keys in sorted order at every depth and
/// without any object member named in `volatile`.
pub fn normalize<S: AsRef<str>>(value: &Value, volatile: &[S]) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|key| !volatile.iter().any(|v| v.as_ref() == key.as_str()))
                .collect();
            keys.sort();

            let mut sorted = Map::with_capacity(keys.len());
            for key in keys {
                sorted.insert(key.clone(), normalize(&map[key], volatile));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| normalize(v, volatile)).collect()),
        other => other.clone(),
    }
}

/// Hex SHA-256 over length-prefixed parts, so `("ab", "c")` and `("a", "bc")` differ.
pub fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_form_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        let b = json!({"a": {"x": null, "y": [1, 2]}, "b": 1});
        assert_eq!(
            serde_json::to_string(&normalize::<&str>(&a, &[])).unwrap(),
            serde_json::to_string(&normalize::<&str>(&b, &[])).unwrap()
        );
    }

    #[test]
    fn test_volatile_fields_removed_at_depth() {
        let value = json!({
            "nonce": "abc",
            "settings": {"color": "red", "timestamp": 17, "items": [{"request_id": "r1", "k": 1}]}
        });
        let normalized = normalize(&value, DEFAULT_VOLATILE_FIELDS);
        assert_eq!(
            normalized,
            json!({"settings": {"color": "red", "items": [{"k": 1}]}})
        );
    }

    #[test]
    fn test_digest_is_length_prefixed() {
        assert_ne!(digest(&["ab", "c"]), digest(&["a", "bc"]));
        assert_eq!(digest(&["x"]).len(), 64);
        assert_eq!(digest(&["x", "y"]), digest(&["x", "y"]));
    }
}
