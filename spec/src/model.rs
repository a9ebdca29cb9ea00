//! Typed request/target/certificate/epoch records (SPEC_FULL.md §3).
//!
//! These replace the source's duck-typed dataclasses with constructors that
//! validate invariants up front, per the "Source patterns requiring
//! re-architecture" notes in §9.

use serde::{Deserialize, Serialize};

use crate::errors::TargetValidationError;
use crate::hash::{sha256_prefixed_digest, ZERO_HASH};

/// Kind of file a [`MutationTarget`] touches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// The agent's `dna.json` identity/config file.
    Dna,
    /// General configuration.
    Config,
    /// Agent skill definitions.
    Skills,
    /// Runtime state.
    Runtime,
    /// Security-sensitive surface.
    Security,
    /// Governance-sensitive surface.
    Governance,
    /// Arbitrary code.
    Code,
    /// Documentation.
    Docs,
}

impl TargetType {
    /// Weight used by the impact scorer's structural-risk component (§4.8).
    pub fn structural_weight(self) -> f64 {
        match self {
            TargetType::Runtime | TargetType::Security | TargetType::Governance => 1.0,
            TargetType::Code => 0.8,
            TargetType::Dna => 0.3,
            TargetType::Config | TargetType::Skills => 0.2,
            TargetType::Docs => 0.1,
        }
    }
}

/// Declared authority level of a [`MutationRequest`], bounding the maximum
/// accepted impact score (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthorityLevel {
    /// Maximum accepted impact 0.20.
    LowImpact,
    /// Maximum accepted impact 0.50.
    GovernorReview,
    /// Maximum accepted impact 1.00.
    HighImpact,
}

impl AuthorityLevel {
    /// Maximum accepted impact total for this authority level.
    pub fn max_impact(self) -> f64 {
        match self {
            AuthorityLevel::LowImpact => 0.20,
            AuthorityLevel::GovernorReview => 0.50,
            AuthorityLevel::HighImpact => 1.00,
        }
    }
}

/// A single operation applied to a target file. Kept as opaque JSON: the
/// operation vocabulary (`set`, `merge`, ...) belongs to the agent-authoring
/// surface, which is out of scope here (§1).
pub type OpRecord = serde_json::Value;

/// One file-level mutation target within a [`MutationRequest`] (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MutationTarget {
    /// Owning agent.
    pub agent_id: String,
    /// Path relative to the agent root.
    pub path: String,
    /// Kind of file being touched.
    pub target_type: TargetType,
    /// Ordered operations to apply.
    pub ops: Vec<OpRecord>,
    /// Optional expected pre-image digest of the target file before mutation.
    #[serde(default)]
    pub hash_preimage: String,
}

impl MutationTarget {
    /// Construct a target, validating the path-containment and `dna` mapping
    /// invariants from §3 up front.
    pub fn new(
        agent_id: impl Into<String>,
        path: impl Into<String>,
        target_type: TargetType,
        ops: Vec<OpRecord>,
        hash_preimage: impl Into<String>,
    ) -> Result<Self, TargetValidationError> {
        let path = path.into();
        validate_contained_path(&path)?;
        if target_type == TargetType::Dna && path != "dna.json" {
            return Err(TargetValidationError::DnaPathMismatch(path));
        }
        Ok(Self {
            agent_id: agent_id.into(),
            path,
            target_type,
            ops,
            hash_preimage: hash_preimage.into(),
        })
    }
}

/// Banned absolute path prefixes (SPEC_FULL.md §6).
pub const BANNED_PATH_PREFIXES: &[&str] = &["/workspace/", "/home/", "/sdcard/", "/storage/"];

/// Validate that `path` resolves inside an agent root: no traversal, no
/// absolute paths, none of the banned prefixes.
pub fn validate_contained_path(path: &str) -> Result<(), TargetValidationError> {
    if path.is_empty() {
        return Err(TargetValidationError::EmptyPath);
    }
    if path.starts_with('/') || BANNED_PATH_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return Err(TargetValidationError::AbsolutePath(path.to_string()));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(TargetValidationError::PathTraversal(path.to_string()));
    }
    Ok(())
}

/// A governance-submitted mutation bundle (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MutationRequest {
    /// Submitting agent.
    pub agent_id: String,
    /// Generation timestamp (RFC3339), opaque to this layer.
    pub generation_ts: String,
    /// Free-form intent label, used as the certificate's default strategy.
    pub intent: String,
    /// Request-level operations (in addition to per-target ops).
    #[serde(default)]
    pub ops: Vec<OpRecord>,
    /// Signature string, verified via the Cryovant predicate (C21).
    pub signature: String,
    /// Anti-replay nonce.
    pub nonce: String,
    /// Per-file targets.
    #[serde(default)]
    pub targets: Vec<MutationTarget>,
    /// Epoch this request is submitted against.
    #[serde(default)]
    pub epoch_id: String,
    /// Caller-supplied bundle id, if any (§4.9 step 6).
    #[serde(default)]
    pub bundle_id: String,
    /// Caller-supplied random seed (off-mode determinism hint only).
    #[serde(default)]
    pub random_seed: u64,
    /// Capability scopes requested.
    #[serde(default)]
    pub capability_scopes: Vec<String>,
    /// Declared authority level.
    pub authority_level: AuthorityLevel,
}

impl MutationRequest {
    /// True if the request carries no targets and no request-level ops.
    pub fn is_empty_bundle(&self) -> bool {
        self.targets.is_empty() && self.ops.is_empty()
    }

    /// Total operation count across the request and all targets, used by the
    /// impact scorer's semantic-depth component (§4.8).
    pub fn total_ops(&self) -> usize {
        self.ops.len() + self.targets.iter().map(|t| t.ops.len()).sum::<usize>()
    }

    /// Distinct target types present, used by the lineage-divergence component.
    pub fn distinct_target_types(&self) -> usize {
        let mut types: Vec<TargetType> = self.targets.iter().map(|t| t.target_type).collect();
        types.sort_by_key(|t| format!("{t:?}"));
        types.dedup();
        types.len()
    }
}

/// Where a certificate's `bundle_id` came from (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BundleIdSource {
    /// Supplied directly on the request.
    Request,
    /// Derived deterministically (or via UUID, in `off` mode) by the Governor.
    Governor,
}

/// The governance artifact authorizing an accepted bundle (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Certificate {
    /// Epoch the bundle was accepted into.
    pub epoch_id: String,
    /// Bundle identifier.
    pub bundle_id: String,
    /// Provenance of `bundle_id`.
    pub bundle_id_source: BundleIdSource,
    /// Strategy labels (`[intent, "default"]` per §4.9).
    pub strategy_set: Vec<String>,
    /// Canonical strategy snapshot.
    pub strategy_snapshot: serde_json::Value,
    /// Digest of `strategy_snapshot`.
    pub strategy_snapshot_hash: String,
    /// Digest of the strategy set itself.
    pub strategy_hash: String,
    /// Computed impact score (§4.8).
    pub impact_score: f64,
    /// Epoch digest at acceptance time (or `ZERO_HASH` for an empty epoch).
    pub checkpoint_digest: String,
    /// Authority signatures accumulated on this certificate.
    #[serde(default)]
    pub authority_signatures: Vec<String>,
    /// Whether the certificate has been activated (attached to a lifecycle context).
    #[serde(default)]
    pub certificate_activated: bool,
}

impl Certificate {
    /// Build the certificate's strategy set and hashes from a request's intent.
    pub fn strategy_set_for(intent: &str) -> Vec<String> {
        vec![intent.to_string(), "default".to_string()]
    }

    /// Digest of (epoch_id, bundle_id, impact, strategy_set, strategy_snapshot_hash,
    /// strategy_version_set, certificate) per the bundle-digest formula in §3.
    pub fn bundle_digest(&self, strategy_version_set: &[String]) -> String {
        let material = serde_json::json!({
            "epoch_id": self.epoch_id,
            "bundle_id": self.bundle_id,
            "impact": self.impact_score,
            "strategy_set": self.strategy_set,
            "strategy_snapshot_hash": self.strategy_snapshot_hash,
            "strategy_version_set": strategy_version_set,
            "certificate": self,
        });
        sha256_prefixed_digest(&material)
    }
}

/// Persistent epoch lifecycle state, exclusively owned by the Epoch Manager (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpochState {
    /// `epoch-<utc-compact>-<suffix>`.
    pub epoch_id: String,
    /// ISO-8601 start timestamp.
    pub start_ts: String,
    /// Arbitrary caller metadata (e.g. rotation `reason`).
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Governor version string, recorded for forensic traceability.
    pub governor_version: String,
    /// Number of `MutationBundleEvent`s accepted so far this epoch.
    #[serde(default)]
    pub mutation_count: u64,
}

/// Trust posture of a lifecycle context (§3): `dev` accepts the Cryovant
/// dev-mode signature fallback, `prod` requires a real verifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrustMode {
    /// Development mode: `cryovant-dev-*` signatures accepted.
    Dev,
    /// Production mode: only a real verifier is accepted.
    Prod,
}

/// Declared lifecycle states of a mutation (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Request accepted by the Governor, not yet staged.
    Proposed,
    /// Staged for certification.
    Staged,
    /// Certificate attached.
    Certified,
    /// Actively applying file mutations.
    Executing,
    /// Mutation fully applied and committed.
    Completed,
    /// Mutation discarded.
    Pruned,
}

impl LifecycleState {
    /// Terminal states have their context file deleted rather than persisted.
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Completed | LifecycleState::Pruned)
    }
}

/// Canonical body of a rollback certificate, hashed and HMAC-signed (§3, §4.14).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackCertificateBody {
    /// Schema tag, always `"rollback-certificate/v1"`.
    pub schema: String,
    /// Mutation this certificate rolls back.
    pub mutation_id: String,
    /// Epoch the mutation belonged to.
    pub epoch_id: String,
    /// Digest of state before the rollback.
    pub prior_state_digest: String,
    /// Digest of state after the rollback.
    pub restored_state_digest: String,
    /// Why the rollback was triggered.
    pub trigger_reason: String,
    /// Class of actor that triggered the rollback (`governor`, `operator`, ...).
    pub actor_class: String,
    /// One boolean per restored target, keyed by path.
    pub completeness_checks: std::collections::BTreeMap<String, bool>,
    /// Digest of whatever forward certificate this rollback supersedes, if any.
    pub forward_certificate_digest: String,
    /// Issuance timestamp, echoed verbatim on verification (§3).
    pub issued_at: String,
}

impl RollbackCertificateBody {
    /// Schema tag for rollback certificates.
    pub const SCHEMA: &'static str = "rollback-certificate/v1";

    /// Canonical digest of this body (excludes any signature block).
    pub fn digest(&self) -> String {
        sha256_prefixed_digest(self)
    }
}

/// Default checkpoint digest for an epoch that has not accepted any bundles.
pub fn zero_checkpoint_digest() -> String {
    ZERO_HASH.to_string()
}
