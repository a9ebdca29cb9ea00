//! `sha256:<hex>` digest primitives shared by every ledger, journal, checkpoint,
//! certificate, and event in the system.

use serde::Serialize;
use sha2::{Digest as _, Sha256};

use crate::canonical::canonical_json;

/// The zero-hash sentinel used as the tail of an empty ledger/journal/checkpoint
/// chain: `sha256:` followed by 64 ASCII zeros.
pub const ZERO_HASH: &str = "sha256:0000000000000000000000000000000000000000000000000000000000000000";

/// Hex-only zero hash (no `sha256:` prefix), used for ledger line `prev_hash`.
pub const ZERO_HASH_HEX: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Plain lower-hex sha256 digest of raw bytes.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}

/// Lower-hex sha256 digest of the canonical-JSON encoding of `value`.
pub fn sha256_digest<T: Serialize>(value: &T) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

/// `sha256:<hex>`-prefixed digest of the canonical-JSON encoding of `value`.
pub fn sha256_prefixed_digest<T: Serialize>(value: &T) -> String {
    format!("sha256:{}", sha256_digest(value))
}

/// `sha256:<hex>`-prefixed digest of raw bytes (no canonicalization).
pub fn sha256_prefixed_bytes(bytes: impl AsRef<[u8]>) -> String {
    format!("sha256:{}", sha256_hex(bytes))
}

/// Hash-chain one ledger/journal entry: `sha256(prev_hash || canonical_json(entry))`.
///
/// `prev_hash` is the raw hex tail of the previous line (no `sha256:` prefix);
/// this matches the wire format in SPEC_FULL.md §6 where `prev_hash`/`hash` fields
/// are bare 64-hex strings, distinct from the `sha256:`-prefixed digests used
/// elsewhere (epoch digests, certificate digests, bundle digests).
pub fn chain_hash<T: Serialize>(prev_hash: &str, entry: &T) -> String {
    let material = format!("{prev_hash}{}", canonical_json(entry));
    sha256_hex(material.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn zero_hash_has_64_hex_zeros() {
        assert_eq!(ZERO_HASH, format!("sha256:{}", "0".repeat(64)));
        assert_eq!(ZERO_HASH_HEX.len(), 64);
    }

    #[test]
    fn equal_payloads_hash_equal_regardless_of_field_order() {
        let a = json!({"type": "X", "payload": {"a": 1, "b": 2}});
        let b = json!({"payload": {"b": 2, "a": 1}, "type": "X"});
        assert_eq!(sha256_digest(&a), sha256_digest(&b));
    }

    #[test]
    fn chain_hash_depends_on_prev() {
        let entry = json!({"type": "X", "payload": {}});
        let h1 = chain_hash(ZERO_HASH_HEX, &entry);
        let h2 = chain_hash(&h1, &entry);
        assert_ne!(h1, h2);
    }
}
