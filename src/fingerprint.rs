//! Content fingerprints for change detection.
//!
//! A record's fingerprint is a SHA-256 over its business fields serialized
//! with sorted keys, so the same payload always hashes the same regardless
//! of field order or when it was fetched. Fetch metadata (site, timestamp,
//! run id) is deliberately not part of the input.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Compute the fingerprint of one record's business payload.
pub fn record_fingerprint(payload: &Map<String, Value>) -> String {
    let ordered: BTreeMap<&String, &Value> = payload.iter().collect();
    let canonical =
        serde_json::to_string(&ordered).expect("JSON object with string keys serializes");

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint-of-fingerprints for a whole mirrored set, order-independent.
pub fn aggregate_fingerprint(fingerprints: &[String]) -> String {
    let mut sorted: Vec<&str> = fingerprints.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    for fp in sorted {
        hasher.update(fp.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}
