//! Hashing System - SHA-256 for Template Content
//!
//! Provides deterministic, reproducible digests for bundle integrity.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{to_string, Value};
use sha2::{Digest, Sha256};

use crate::document::FIELD_HASH;

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    let sorted = sort_value(&v);
    to_string(&sorted)
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let sorted_map: serde_json::Map<String, Value> = sorted
                .into_iter()
                .map(|(k, v)| (k.clone(), sort_value(v)))
                .collect();
            Value::Object(sorted_map)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_value).collect()),
        _ => v.clone(),
    }
}

/// Compute the canonical content hash of a document's metadata + body.
///
/// The stored hash field is stripped from the metadata before hashing, so a
/// previously written digest never feeds back into the next one.
pub fn compute_template_hash(
    metadata: &serde_yaml::Mapping,
    body: &str,
) -> Result<String, serde_json::Error> {
    let mut stripped = metadata.clone();
    stripped.remove(serde_yaml::Value::String(FIELD_HASH.to_string()));
    let canonical = canonical_json(&stripped)?;
    let combined = format!("{}\n{}", canonical, body);
    Ok(sha256_hex(combined.as_bytes()))
}

/// Compute the hash of an on-disk artifact's exact bytes.
pub fn compute_file_hash(path: &std::path::Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(sha256_hex(&bytes))
}

/// Short second-granularity digest of a timestamp.
///
/// Used only as a human-legible batch token. Two builds in the same second
/// share a token; this is not a uniqueness guarantee.
pub fn time_hash(timestamp: &DateTime<Utc>) -> String {
    let stamp = timestamp.format("%Y-%m-%d %H:%M:%S").to_string();
    let full = sha256_hex(stamp.as_bytes());
    full[..10].to_string()
}

// We need hex encoding
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}
