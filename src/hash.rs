//! Content hashing, schema fingerprints, and deterministic node ids.
//!
//! Hashes are the sole inputs driving incremental work; no timestamps or
//! mtimes are ever consulted.

use sha2::{Digest, Sha256};

/// Length of persisted hashes: a 16-hex-char prefix of SHA-256.
pub const HASH_LEN: usize = 16;

/// Compute the 16-hex-char content hash of a byte slice.
///
/// Deterministic and stable across runs.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(HASH_LEN);
    for byte in digest.iter().take(HASH_LEN / 2) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Compute the content hash of a string.
pub fn content_hash_str(text: &str) -> String {
    content_hash(text.as_bytes())
}

/// Compute a schema fingerprint for a label from the set of property names
/// the current writer emits.
///
/// The fingerprint changes iff the property-name set changes; property values
/// never influence it. Name order is normalized so callers may pass the set
/// in any order.
pub fn schema_hash(label: &str, property_names: &[&str]) -> String {
    let mut names: Vec<&str> = property_names.to_vec();
    names.sort_unstable();
    names.dedup();
    let seed = format!("{label}\n{}", names.join("\n"));
    content_hash(seed.as_bytes())
}

/// Derive a deterministic typed node uuid from a stable seed.
///
/// Re-parsing unchanged content must reproduce identical uuids; the per-node
/// hash diff in the ingestion manager relies on this.
pub fn node_uuid(prefix: &str, seed: &str) -> String {
    format!("{prefix}:{}", content_hash(seed.as_bytes()))
}
