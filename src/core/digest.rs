//! SC-005: Canonical JSON and BLAKE3 config digests.

use std::collections::BTreeMap;

/// Serialize a JSON value canonically: object keys sorted, no whitespace.
/// Two structurally equal values always produce the same string.
pub fn canonical_json(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote(s),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, canonical_json(v))).collect();
            let parts: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", quote(k), v))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

fn quote(s: &str) -> String {
    // Serializing a &str to JSON cannot fail.
    serde_json::to_string(s).unwrap_or_default()
}

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Canonical form and digest of a parameter snapshot.
pub fn config_digest(snapshot: &serde_json::Value) -> (String, String) {
    let canonical = canonical_json(snapshot);
    let digest = hash_string(&canonical);
    (canonical, digest)
}
