//! Replay Engine and Verifier (C11): recompute an epoch's chained digest
//! from the ledger and classify cross-node divergence (§4.11).

use std::path::{Path, PathBuf};

use governor_spec::{canonical_json, sha256_prefixed_bytes};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::federation::{JoinedDecision, Precedence};
use crate::lineage::{LedgerError, LedgerLine, LineageLedger};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Output of [`replay_epoch`] (§4.11).
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub digest: String,
    pub canonical_digest: String,
    pub events: Vec<LedgerLine>,
}

/// Recompute the chained digest for `epoch_id` from the ledger's events
/// (§4.11).
pub fn replay_epoch(ledger: &LineageLedger, epoch_id: &str) -> Result<ReplayOutcome, ReplayError> {
    let events = ledger.read_epoch(epoch_id)?;
    let digest = ledger.compute_incremental_epoch_digest(epoch_id)?;
    let canonical_material = serde_json::json!({
        "epoch_id": epoch_id,
        "digest": digest,
        "events": events,
    });
    let canonical_digest = sha256_prefixed_bytes(canonical_json(&canonical_material));
    Ok(ReplayOutcome {
        digest,
        canonical_digest,
        events,
    })
}

/// A peer's attested digest for an epoch (§4.11).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attestation {
    pub peer_id: String,
    pub attested_digest: String,
    pub manifest_digest: String,
    pub policy_version: String,
}

/// Federated divergence classification (§4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftClass {
    None,
    LocalDigestMismatch,
    FederatedSplitBrain,
    CrossNodeAttestationMismatch,
}

impl DriftClass {
    pub fn as_str(self) -> &'static str {
        match self {
            DriftClass::None => "none",
            DriftClass::LocalDigestMismatch => "drift_local_digest_mismatch",
            DriftClass::FederatedSplitBrain => "drift_federated_split_brain",
            DriftClass::CrossNodeAttestationMismatch => "drift_cross_node_attestation_mismatch",
        }
    }
}

/// Result of [`ReplayVerifier::verify_epoch`] (§4.11).
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    pub local_passed: bool,
    pub drift_class: DriftClass,
    pub joined_decision: JoinedDecision,
    pub recomputed_digest: String,
}

/// Verifies replayed epochs against expected digests and peer attestations.
pub struct ReplayVerifier<'a> {
    ledger: &'a LineageLedger,
    state_path: Option<PathBuf>,
    verify_every_nth: u64,
}

impl<'a> ReplayVerifier<'a> {
    pub fn new(ledger: &'a LineageLedger) -> Self {
        Self {
            ledger,
            state_path: None,
            verify_every_nth: 3,
        }
    }

    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    pub fn with_verify_every_nth(mut self, n: u64) -> Self {
        self.verify_every_nth = n.max(1);
        self
    }

    /// Periodic gate: verify every Nth mutation (default every 3rd) (§4.11).
    pub fn should_verify(&self, mutation_count: u64) -> bool {
        mutation_count > 0 && mutation_count % self.verify_every_nth == 0
    }

    /// Replay `epoch_id`, compare against `expected_digest` and peer
    /// `attestations`, classify drift, resolve governance precedence, and
    /// append the corresponding ledger events (§4.11).
    pub fn verify_epoch(
        &self,
        epoch_id: &str,
        expected_digest: &str,
        attestations: &[Attestation],
        precedence: Precedence,
    ) -> Result<VerificationOutcome, ReplayError> {
        let replay = replay_epoch(self.ledger, epoch_id)?;
        let local_passed = replay.digest == expected_digest;

        let mut sorted = attestations.to_vec();
        sorted.sort();

        let drift_class = classify_drift(local_passed, expected_digest, &replay.digest, &sorted);
        let federated_passed = matches!(drift_class, DriftClass::None);
        let joined_decision = crate::federation::resolve_governance_precedence(
            local_passed,
            federated_passed,
            precedence,
        );

        self.ledger.append_event(
            "ReplayVerificationEvent",
            serde_json::json!({
                "epoch_id": epoch_id,
                "drift_class": drift_class.as_str(),
                "recomputed_digest": replay.digest,
                "expected_digest": expected_digest,
            }),
        )?;

        if matches!(drift_class, DriftClass::None) {
            self.ledger.append_event(
                "FederationVerificationEvent",
                serde_json::json!({
                    "round_id": epoch_id,
                    "vote_digest_valid": true,
                    "exchange_digest_valid": true,
                }),
            )?;
        } else {
            self.ledger.append_event(
                "FederationDivergenceEvent",
                serde_json::json!({
                    "round_id": epoch_id,
                    "drift_class": drift_class.as_str(),
                    "local_digest": replay.digest,
                    "federated_digest": sorted.first().map(|a| a.attested_digest.clone()).unwrap_or_default(),
                }),
            )?;
        }

        self.persist_snapshot(epoch_id, &replay.digest, &sorted);

        Ok(VerificationOutcome {
            local_passed,
            drift_class,
            joined_decision,
            recomputed_digest: replay.digest,
        })
    }

    /// Best-effort auxiliary snapshot write; a failure here must never
    /// fail-close the verifier's governance outcome (§4.11).
    fn persist_snapshot(&self, epoch_id: &str, digest: &str, attestations: &[Attestation]) {
        let Some(path) = &self.state_path else {
            return;
        };
        let snapshot = serde_json::json!({
            "epoch_id": epoch_id,
            "digest": digest,
            "attestations": attestations,
        });
        let canonical = canonical_json(&snapshot);
        if let Err(err) = write_snapshot(path, &canonical) {
            tracing::debug!(error = %err, "federation snapshot persist failed (non-fatal)");
        }
    }
}

fn write_snapshot(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

fn classify_drift(
    local_passed: bool,
    expected_digest: &str,
    replay_digest: &str,
    attestations: &[Attestation],
) -> DriftClass {
    if attestations.is_empty() {
        return if local_passed {
            DriftClass::None
        } else {
            DriftClass::LocalDigestMismatch
        };
    }
    let distinct: std::collections::BTreeSet<&str> =
        attestations.iter().map(|a| a.attested_digest.as_str()).collect();
    if distinct.len() >= 2 {
        return DriftClass::FederatedSplitBrain;
    }
    let outside = attestations
        .iter()
        .any(|a| a.attested_digest != expected_digest && a.attested_digest != replay_digest);
    if outside {
        return DriftClass::CrossNodeAttestationMismatch;
    }
    if local_passed {
        DriftClass::None
    } else {
        DriftClass::LocalDigestMismatch
    }
}
