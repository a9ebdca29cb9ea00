//! Shared types, canonical encoding, and hashing primitives for the
//! governance-and-replay core (SPEC_FULL.md §3, §4).
//!
//! This crate has no I/O and no interior mutability: everything here is a
//! pure function or a plain data type, consumed by `governor-core`.

pub mod canonical;
pub mod errors;
pub mod events;
pub mod hash;
pub mod model;

pub use canonical::{canonical_json, canonical_json_value};
pub use errors::TargetValidationError;
pub use hash::{
    chain_hash, sha256_digest, sha256_hex, sha256_prefixed_bytes, sha256_prefixed_digest,
    ZERO_HASH, ZERO_HASH_HEX,
};
pub use model::{
    AuthorityLevel, BundleIdSource, Certificate, EpochState, LifecycleState, MutationRequest,
    MutationTarget, RollbackCertificateBody, TargetType, TrustMode,
};
