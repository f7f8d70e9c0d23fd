//! Order-independent pod-set fingerprint
//!
//! Summarizes the currently observed set of (namespace, pod name) pairs into
//! a short stable hash, letting downstream consumers detect "nothing
//! changed" without deep-comparing the zone list.

use sha2::{Digest, Sha256};

/// Annotation key carrying the fingerprint on the published object.
pub const FINGERPRINT_ANNOTATION: &str = "topology.node.k8s.io/podset-fingerprint";

/// Version prefix, bumped if the hashing scheme ever changes.
const FINGERPRINT_PREFIX: &str = "pfp0v001";

/// Compute the fingerprint over `(namespace, name)` pairs. Input order does
/// not affect the result; duplicate pairs count once.
pub fn compute(pods: &[(String, String)]) -> String {
    let mut entries: Vec<String> = pods
        .iter()
        .map(|(namespace, name)| format!("{namespace}/{name}"))
        .collect();
    entries.sort();
    entries.dedup();

    let mut hasher = Sha256::new();
    for entry in &entries {
        hasher.update(entry.as_bytes());
        hasher.update(b"\n");
    }

    format!("{FINGERPRINT_PREFIX}{}", hex::encode(hasher.finalize()))
}
