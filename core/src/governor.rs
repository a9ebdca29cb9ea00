//! Evolution Governor (C9): the gatekeeper that validates mutation bundles
//! against signature, epoch, impact, and authority-matrix checks, issuing
//! certificates on acceptance (§4.9).

use governor_spec::{
    sha256_digest, BundleIdSource, Certificate, EpochState, MutationRequest,
};
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::ReplayMode;
use crate::cryovant::SignaturePredicate;
use crate::determinism::{require_replay_safe_provider, DeterminismProvider};
use crate::entropy::{charge_entropy, EntropySource};
use crate::impact::compute_impact;
use crate::lineage::{LedgerError, LineageLedger};

/// Machine-readable rejection reason codes (§7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    #[error("governor_fail_closed")]
    GovernorFailClosed,
    #[error("empty_bundle")]
    EmptyBundle,
    #[error("missing_epoch")]
    MissingEpoch,
    #[error("epoch_not_started")]
    EpochNotStarted,
    #[error("invalid_signature")]
    InvalidSignature,
    #[error("lineage_continuity_failed")]
    LineageContinuityFailed,
    #[error("impact_threshold_exceeded")]
    ImpactThresholdExceeded,
    #[error("authority_level_exceeded")]
    AuthorityLevelExceeded,
    #[error("entropy_budget_exceeded")]
    EntropyBudgetExceeded,
    #[error("non_deterministic_provider_in_replay_safe_mode")]
    NonDeterministicProviderInReplaySafeMode,
}

/// Outcome of [`Governor::validate_bundle`].
#[derive(Debug, Clone)]
pub enum GovernorDecision {
    Accepted {
        certificate: Certificate,
        epoch_digest: String,
    },
    Rejected {
        reason: RejectionReason,
        impact_score: Option<f64>,
    },
}

/// Storage-layer failures surfaced while recording a decision.
#[derive(Debug, Error)]
pub enum GovernorError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Gatekeeper over a single lineage ledger. Fail-closed: once tripped,
/// every subsequent call to [`Governor::validate_bundle`] is rejected until
/// an explicit recovery event clears the flag (§4.9).
pub struct Governor {
    ledger: LineageLedger,
    signature_predicate: Box<dyn SignaturePredicate>,
    provider: Box<dyn DeterminismProvider>,
    replay_mode: ReplayMode,
    max_impact: f64,
    fail_closed: Mutex<bool>,
}

impl Governor {
    pub fn new(
        ledger: LineageLedger,
        signature_predicate: Box<dyn SignaturePredicate>,
        provider: Box<dyn DeterminismProvider>,
        replay_mode: ReplayMode,
        max_impact: f64,
    ) -> Self {
        Self {
            ledger,
            signature_predicate,
            provider,
            replay_mode,
            max_impact,
            fail_closed: Mutex::new(false),
        }
    }

    /// Whether the governor is currently in a fail-closed state.
    pub fn is_fail_closed(&self) -> bool {
        *self.fail_closed.lock()
    }

    /// Trip the fail-closed state machine (§4.9).
    pub fn enter_fail_closed(&self, reason: &str) {
        tracing::error!(reason, "governor entering fail_closed state");
        *self.fail_closed.lock() = true;
    }

    /// Clear the fail-closed flag. Requires a `human-recovery-` prefixed
    /// signature and a `ConstitutionalReset` tier; softer tiers are recorded
    /// but do not clear the flag (§4.9).
    pub fn apply_recovery_event(
        &self,
        recovery_signature: &str,
        tier: crate::determinism::RecoveryTier,
    ) -> bool {
        use crate::determinism::RecoveryTier;
        if !recovery_signature.starts_with("human-recovery-") {
            return false;
        }
        if matches!(tier, RecoveryTier::ConstitutionalReset) {
            *self.fail_closed.lock() = false;
            tracing::info!("governor fail_closed cleared via constitutional reset");
            true
        } else {
            tracing::info!(?tier, "recovery attempt recorded, fail_closed not cleared");
            false
        }
    }

    /// Validate and, on acceptance, record a mutation bundle (§4.9).
    pub fn validate_bundle(
        &self,
        request: &MutationRequest,
        epoch_state: Option<&EpochState>,
    ) -> Result<GovernorDecision, GovernorError> {
        let decision = self.decide(request, epoch_state);
        match &decision {
            GovernorDecision::Accepted {
                certificate,
                epoch_digest: _,
            } => {
                tracing::info!(
                    epoch_id = %request.epoch_id,
                    bundle_id = %certificate.bundle_id,
                    impact = certificate.impact_score,
                    "governance decision: accepted"
                );
                let bundle_payload = serde_json::json!({
                    "agent_id": request.agent_id,
                    "bundle_id": certificate.bundle_id,
                    "bundle_id_source": certificate.bundle_id_source,
                    "strategy_set": certificate.strategy_set,
                    "strategy_snapshot_hash": certificate.strategy_snapshot_hash,
                    "strategy_hash": certificate.strategy_hash,
                    "impact": certificate.impact_score,
                    "checkpoint_digest": certificate.checkpoint_digest,
                    "certificate": certificate,
                });
                let (_, epoch_digest) = self
                    .ledger
                    .append_bundle_with_digest(&request.epoch_id, bundle_payload)?;
                Ok(GovernorDecision::Accepted {
                    certificate: certificate.clone(),
                    epoch_digest,
                })
            }
            GovernorDecision::Rejected {
                reason,
                impact_score,
            } => {
                tracing::info!(
                    epoch_id = %request.epoch_id,
                    reason = %reason,
                    "governance decision: rejected"
                );
                self.ledger.append_event(
                    "GovernanceDecisionEvent",
                    serde_json::json!({
                        "epoch_id": request.epoch_id,
                        "agent_id": request.agent_id,
                        "accepted": false,
                        "reason_code": reason.to_string(),
                        "impact_score": impact_score,
                    }),
                )?;
                Ok(decision)
            }
        }
    }

    fn decide(
        &self,
        request: &MutationRequest,
        epoch_state: Option<&EpochState>,
    ) -> GovernorDecision {
        if self.is_fail_closed() {
            return reject(RejectionReason::GovernorFailClosed, None);
        }
        if request.is_empty_bundle() {
            return reject(RejectionReason::EmptyBundle, None);
        }
        let epoch_state = match epoch_state {
            Some(state) => state,
            None => return reject(RejectionReason::MissingEpoch, None),
        };
        if epoch_state.epoch_id != request.epoch_id {
            return reject(RejectionReason::EpochNotStarted, None);
        }
        if !self
            .signature_predicate
            .verify(&request.signature, &request.agent_id)
        {
            return reject(RejectionReason::InvalidSignature, None);
        }
        if request.nonce.is_empty() || request.generation_ts.is_empty() {
            return reject(RejectionReason::LineageContinuityFailed, None);
        }

        let impact = compute_impact(request);
        if impact.total > self.max_impact {
            return reject(RejectionReason::ImpactThresholdExceeded, Some(impact.total));
        }
        if impact.total > request.authority_level.max_impact() {
            return reject(RejectionReason::AuthorityLevelExceeded, Some(impact.total));
        }

        if charge_entropy(EntropySource::Provider, "governor_bundle_id").is_err() {
            return reject(RejectionReason::EntropyBudgetExceeded, Some(impact.total));
        }
        let (bundle_id, bundle_id_source) = if !request.bundle_id.is_empty() {
            (request.bundle_id.clone(), BundleIdSource::Request)
        } else if matches!(self.replay_mode, ReplayMode::Strict | ReplayMode::Audit) {
            if require_replay_safe_provider(self.provider.as_ref(), self.replay_mode, None).is_err() {
                return reject(
                    RejectionReason::NonDeterministicProviderInReplaySafeMode,
                    Some(impact.total),
                );
            }
            (
                self.provider
                    .next_id(&format!("bundle:{}:{}", request.agent_id, request.nonce), 16),
                BundleIdSource::Governor,
            )
        } else {
            (uuid::Uuid::new_v4().simple().to_string()[..16].to_string(), BundleIdSource::Governor)
        };

        let strategy_set = Certificate::strategy_set_for(&request.intent);
        let strategy_snapshot = serde_json::json!({
            "ops": request.ops,
            "targets": request.targets,
        });
        let strategy_snapshot_hash = sha256_digest(&strategy_snapshot);
        let strategy_hash = sha256_digest(&strategy_set);
        let checkpoint_digest = self.ledger.expected_epoch_digest(&request.epoch_id);

        let certificate = Certificate {
            epoch_id: request.epoch_id.clone(),
            bundle_id,
            bundle_id_source,
            strategy_set,
            strategy_snapshot,
            strategy_snapshot_hash,
            strategy_hash,
            impact_score: impact.total,
            checkpoint_digest,
            authority_signatures: vec![],
            certificate_activated: false,
        };

        GovernorDecision::Accepted {
            certificate,
            epoch_digest: String::new(),
        }
    }
}

fn reject(reason: RejectionReason, impact_score: Option<f64>) -> GovernorDecision {
    GovernorDecision::Rejected {
        reason,
        impact_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryovant::DevSignaturePredicate;
    use crate::determinism::SeededProvider;
    use governor_spec::{AuthorityLevel, MutationTarget, TargetType};

    fn governor() -> (tempfile::TempDir, Governor) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = LineageLedger::open(dir.path().join("lineage.jsonl")).unwrap();
        let gov = Governor::new(
            ledger,
            Box::new(DevSignaturePredicate),
            Box::new(SeededProvider::new("runtime-seed")),
            ReplayMode::Off,
            0.99,
        );
        (dir, gov)
    }

    fn governor_with(provider: Box<dyn DeterminismProvider>, replay_mode: ReplayMode) -> (tempfile::TempDir, Governor) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = LineageLedger::open(dir.path().join("lineage.jsonl")).unwrap();
        let gov = Governor::new(ledger, Box::new(DevSignaturePredicate), provider, replay_mode, 0.99);
        (dir, gov)
    }

    fn epoch() -> EpochState {
        EpochState {
            epoch_id: "epoch-1".to_string(),
            start_ts: "2026-01-01T00:00:00Z".to_string(),
            metadata: serde_json::Value::Null,
            governor_version: "0.1.0".to_string(),
            mutation_count: 0,
        }
    }

    fn base_request(authority_level: AuthorityLevel, target_type: TargetType, op_count: usize) -> MutationRequest {
        let ops: Vec<_> = (0..op_count)
            .map(|i| serde_json::json!({"op": "set", "path": format!("/v{i}"), "value": i}))
            .collect();
        MutationRequest {
            agent_id: "alpha".to_string(),
            generation_ts: "2026-01-01T00:00:00Z".to_string(),
            intent: "test".to_string(),
            ops: vec![],
            signature: "cryovant-dev-alpha".to_string(),
            nonce: "n-1".to_string(),
            targets: vec![MutationTarget::new("alpha", "dna.json", target_type, ops, "").unwrap()],
            epoch_id: "epoch-1".to_string(),
            bundle_id: String::new(),
            random_seed: 0,
            capability_scopes: vec![],
            authority_level,
        }
    }

    #[test]
    fn accepts_well_formed_request() {
        let (_dir, gov) = governor();
        let epoch_state = epoch();
        let request = base_request(AuthorityLevel::GovernorReview, TargetType::Dna, 1);
        let decision = gov.validate_bundle(&request, Some(&epoch_state)).unwrap();
        match decision {
            GovernorDecision::Accepted { certificate, epoch_digest } => {
                assert_eq!(certificate.bundle_id_source, BundleIdSource::Governor);
                assert_ne!(epoch_digest, "sha256:0");
            }
            GovernorDecision::Rejected { reason, .. } => panic!("unexpected rejection: {reason}"),
        }
    }

    #[test]
    fn rejects_authority_level_exceeded() {
        let (_dir, gov) = governor();
        let epoch_state = epoch();
        let mut request = base_request(AuthorityLevel::LowImpact, TargetType::Security, 20);
        request.targets[0].path = "security/core.json".to_string();
        let decision = gov.validate_bundle(&request, Some(&epoch_state)).unwrap();
        assert!(matches!(
            decision,
            GovernorDecision::Rejected {
                reason: RejectionReason::AuthorityLevelExceeded,
                ..
            }
        ));
    }

    #[test]
    fn rejects_missing_epoch() {
        let (_dir, gov) = governor();
        let request = base_request(AuthorityLevel::HighImpact, TargetType::Dna, 1);
        let decision = gov.validate_bundle(&request, None).unwrap();
        assert!(matches!(
            decision,
            GovernorDecision::Rejected {
                reason: RejectionReason::MissingEpoch,
                ..
            }
        ));
    }

    #[test]
    fn rejects_invalid_signature() {
        let (_dir, gov) = governor();
        let epoch_state = epoch();
        let mut request = base_request(AuthorityLevel::HighImpact, TargetType::Dna, 1);
        request.signature = "not-a-real-signature".to_string();
        let decision = gov.validate_bundle(&request, Some(&epoch_state)).unwrap();
        assert!(matches!(
            decision,
            GovernorDecision::Rejected {
                reason: RejectionReason::InvalidSignature,
                ..
            }
        ));
    }

    #[test]
    fn strict_replay_mode_rejects_system_provider() {
        let (_dir, gov) = governor_with(Box::new(crate::determinism::SystemProvider), ReplayMode::Strict);
        let epoch_state = epoch();
        let request = base_request(AuthorityLevel::HighImpact, TargetType::Dna, 1);
        let decision = gov.validate_bundle(&request, Some(&epoch_state)).unwrap();
        assert!(matches!(
            decision,
            GovernorDecision::Rejected {
                reason: RejectionReason::NonDeterministicProviderInReplaySafeMode,
                ..
            }
        ));
    }

    #[test]
    fn strict_replay_mode_accepts_seeded_provider() {
        let (_dir, gov) = governor_with(Box::new(SeededProvider::new("strict-seed")), ReplayMode::Strict);
        let epoch_state = epoch();
        let request = base_request(AuthorityLevel::HighImpact, TargetType::Dna, 1);
        let decision = gov.validate_bundle(&request, Some(&epoch_state)).unwrap();
        assert!(matches!(decision, GovernorDecision::Accepted { .. }));
    }

    #[test]
    fn fail_closed_rejects_everything_until_constitutional_reset() {
        let (_dir, gov) = governor();
        let epoch_state = epoch();
        gov.enter_fail_closed("test trip");
        let request = base_request(AuthorityLevel::HighImpact, TargetType::Dna, 1);
        let decision = gov.validate_bundle(&request, Some(&epoch_state)).unwrap();
        assert!(matches!(
            decision,
            GovernorDecision::Rejected {
                reason: RejectionReason::GovernorFailClosed,
                ..
            }
        ));
        assert!(!gov.apply_recovery_event(
            "human-recovery-op1",
            crate::determinism::RecoveryTier::Soft
        ));
        assert!(gov.is_fail_closed());
        assert!(gov.apply_recovery_event(
            "human-recovery-op1",
            crate::determinism::RecoveryTier::ConstitutionalReset
        ));
        assert!(!gov.is_fail_closed());
    }
}
