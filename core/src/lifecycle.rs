//! Mutation Lifecycle (C13): an explicit state machine with gated
//! transitions, persisted context, and rollback certificates (§4.13).

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use governor_spec::model::zero_checkpoint_digest;
use governor_spec::{sha256_prefixed_digest, LifecycleState, RollbackCertificateBody, TrustMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cryovant::SignaturePredicate;
use crate::journal::{CryovantJournal, JournalError};
use crate::lineage::{LedgerError, LineageLedger};
use crate::transaction::issue_rollback_certificate;

/// The declared `(from, to)` transition table (§4.13) — only these pairs
/// are legal.
const DECLARED_TRANSITIONS: &[(LifecycleState, LifecycleState)] = &[
    (LifecycleState::Proposed, LifecycleState::Staged),
    (LifecycleState::Staged, LifecycleState::Certified),
    (LifecycleState::Certified, LifecycleState::Executing),
    (LifecycleState::Executing, LifecycleState::Completed),
    (LifecycleState::Completed, LifecycleState::Pruned),
];

const ROLLBACK_TRANSITIONS: &[(LifecycleState, LifecycleState)] = &[
    (LifecycleState::Executing, LifecycleState::Certified),
    (LifecycleState::Certified, LifecycleState::Staged),
    (LifecycleState::Staged, LifecycleState::Proposed),
];

/// Persisted per-mutation lifecycle context (§3). Deleted once a terminal
/// state is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleContext {
    pub mutation_id: String,
    pub agent_id: String,
    pub epoch_id: String,
    pub signature: String,
    pub trust_mode: TrustMode,
    pub cert_refs: Vec<String>,
    pub fitness_score: f64,
    pub fitness_threshold: f64,
    pub founders_law_result: Option<bool>,
    pub stage_timestamps: BTreeMap<String, String>,
    pub current_state: LifecycleState,
}

/// Outcome of one guard check, recorded in a [`GuardReport`] (§4.13).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardOutcome {
    pub name: String,
    pub passed: bool,
}

/// One entry per guard evaluated during a transition attempt (§4.13).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GuardReport {
    pub outcomes: Vec<GuardOutcome>,
}

impl GuardReport {
    fn record(&mut self, name: &str, passed: bool) {
        self.outcomes.push(GuardOutcome {
            name: name.to_string(),
            passed,
        });
    }

    fn all_passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }
}

/// Lifecycle errors (§7).
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("undeclared_transition: {from:?}->{to:?}")]
    UndeclaredTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
    #[error("guard_failed:{from:?}->{to:?}")]
    GuardFailed {
        from: LifecycleState,
        to: LifecycleState,
        report: GuardReport,
    },
    #[error("cannot_rollback_from:{0:?}")]
    CannotRollbackFrom(LifecycleState),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Evaluates transition guards and persists lifecycle context files.
pub struct LifecycleEngine<'a> {
    ledger: &'a LineageLedger,
    journal: &'a CryovantJournal,
    signature_predicate: &'a dyn SignaturePredicate,
    context_dir: PathBuf,
}

impl<'a> LifecycleEngine<'a> {
    pub fn new(
        ledger: &'a LineageLedger,
        journal: &'a CryovantJournal,
        signature_predicate: &'a dyn SignaturePredicate,
        context_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ledger,
            journal,
            signature_predicate,
            context_dir: context_dir.into(),
        }
    }

    fn context_path(&self, mutation_id: &str) -> PathBuf {
        self.context_dir.join(format!("{mutation_id}.json"))
    }

    /// Persist a context file for a non-terminal state, or delete it once
    /// terminal (§3).
    fn persist(&self, ctx: &LifecycleContext) -> Result<(), LifecycleError> {
        let path = self.context_path(&ctx.mutation_id);
        if ctx.current_state.is_terminal() {
            let _ = fs::remove_file(&path);
            return Ok(());
        }
        let tmp = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(ctx).map_err(anyhow::Error::new)?;
        fs::write(&tmp, json).map_err(|e| anyhow::Error::new(e).context("write lifecycle context"))?;
        fs::rename(&tmp, &path).map_err(|e| anyhow::Error::new(e).context("rename lifecycle context"))?;
        Ok(())
    }

    /// Attempt `(ctx.current_state -> to)`, evaluating every applicable
    /// guard (§4.13).
    pub fn transition(
        &self,
        mut ctx: LifecycleContext,
        to: LifecycleState,
        now: &str,
    ) -> Result<LifecycleContext, LifecycleError> {
        let span = tracing::info_span!("lifecycle_transition", mutation_id = %ctx.mutation_id, from = ?ctx.current_state, to = ?to);
        let _enter = span.enter();

        let from = ctx.current_state;
        if !DECLARED_TRANSITIONS.contains(&(from, to)) {
            return Err(LifecycleError::UndeclaredTransition { from, to });
        }

        let mut report = GuardReport::default();
        report.record(
            "signature_valid",
            self.signature_valid(&ctx.signature, &ctx.agent_id, ctx.trust_mode),
        );
        report.record("founders_law", self.founders_law(&mut ctx));
        if matches!(
            to,
            LifecycleState::Certified | LifecycleState::Executing | LifecycleState::Completed
        ) {
            report.record("cert_refs_present", !ctx.cert_refs.is_empty());
        }
        if to == LifecycleState::Executing {
            report.record("fitness_threshold", ctx.fitness_score >= ctx.fitness_threshold);
        }

        if report.all_passed() {
            ctx.stage_timestamps.insert(format!("{to:?}"), now.to_string());
            ctx.current_state = to;
            self.persist(&ctx)?;
            self.ledger.append_event(
                "LifecycleTransitionEvent",
                serde_json::json!({"mutation_id": ctx.mutation_id, "from": format!("{from:?}"), "to": format!("{to:?}"), "outcome": "success"}),
            )?;
            self.journal.append(
                &format!("TX-Lifecycle-{}", ctx.mutation_id),
                now,
                "LifecycleTransition",
                serde_json::json!({"mutation_id": ctx.mutation_id, "to": format!("{to:?}")}),
            )?;
            tracing::debug!("transition succeeded");
            Ok(ctx)
        } else {
            self.persist(&ctx)?;
            self.ledger.append_event(
                "LifecycleTransitionEvent",
                serde_json::json!({"mutation_id": ctx.mutation_id, "from": format!("{from:?}"), "to": format!("{to:?}"), "outcome": "guard_failed", "guard_report": report}),
            )?;
            self.journal.append(
                &format!("TX-Lifecycle-{}", ctx.mutation_id),
                now,
                "LifecycleGuardFailed",
                serde_json::json!({"mutation_id": ctx.mutation_id, "guard_report": report}),
            )?;
            tracing::error!(?report, "transition guard failed");
            Err(LifecycleError::GuardFailed { from, to, report })
        }
    }

    fn signature_valid(&self, signature: &str, agent_id: &str, trust_mode: TrustMode) -> bool {
        if trust_mode == TrustMode::Dev && signature.starts_with("cryovant-dev-") {
            return self.signature_predicate.verify(signature, agent_id);
        }
        self.signature_predicate.verify(signature, agent_id)
    }

    /// A fixed invariant predicate, cached per context so it evaluates once
    /// per mutation_id (§4.13).
    fn founders_law(&self, ctx: &mut LifecycleContext) -> bool {
        if let Some(cached) = ctx.founders_law_result {
            return cached;
        }
        let result = !ctx.mutation_id.is_empty() && !ctx.agent_id.is_empty();
        ctx.founders_law_result = Some(result);
        result
    }

    /// Roll back to an earlier state; only the three declared reverse
    /// transitions are legal. Captures a prior/restored state digest pair
    /// and issues a Rollback Certificate attached to `cert_refs` (§4.13,
    /// §4.14).
    pub fn rollback(
        &self,
        mut ctx: LifecycleContext,
        to: LifecycleState,
        reason: &str,
    ) -> Result<LifecycleContext, LifecycleError> {
        let span = tracing::info_span!("lifecycle_rollback", mutation_id = %ctx.mutation_id, from = ?ctx.current_state, to = ?to);
        let _enter = span.enter();

        let from = ctx.current_state;
        if !ROLLBACK_TRANSITIONS.contains(&(from, to)) {
            return Err(LifecycleError::CannotRollbackFrom(from));
        }

        let prior_state_digest = state_digest(&ctx);
        ctx.current_state = to;
        let restored_state_digest = state_digest(&ctx);

        let issued_at = ctx
            .stage_timestamps
            .values()
            .max()
            .cloned()
            .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string());

        let mut completeness_checks = BTreeMap::new();
        completeness_checks.insert("state_rewound".to_string(), ctx.current_state == to);

        let body = RollbackCertificateBody {
            schema: RollbackCertificateBody::SCHEMA.to_string(),
            mutation_id: ctx.mutation_id.clone(),
            epoch_id: ctx.epoch_id.clone(),
            prior_state_digest,
            restored_state_digest,
            trigger_reason: reason.to_string(),
            actor_class: "lifecycle_engine".to_string(),
            completeness_checks,
            forward_certificate_digest: zero_checkpoint_digest(),
            issued_at: issued_at.clone(),
        };
        let cert = issue_rollback_certificate(body, &ctx.mutation_id);
        ctx.cert_refs.push(cert.rollback_certificate_digest.clone());

        self.persist(&ctx)?;
        self.ledger.append_event(
            "LifecycleRollbackEvent",
            serde_json::json!({
                "mutation_id": ctx.mutation_id,
                "from": format!("{from:?}"),
                "to": format!("{to:?}"),
                "reason": reason,
                "rollback_certificate": cert,
            }),
        )?;
        self.journal.append(
            &format!("TX-Lifecycle-{}", ctx.mutation_id),
            &issued_at,
            "LifecycleRollback",
            serde_json::json!({
                "mutation_id": ctx.mutation_id,
                "to": format!("{to:?}"),
                "rollback_certificate_digest": cert.rollback_certificate_digest,
            }),
        )?;
        tracing::debug!(digest = %cert.rollback_certificate_digest, "rollback certificate issued");
        Ok(ctx)
    }

    /// Retry a failed transition with exponential backoff (`2^attempt`
    /// seconds); `sleep_fn` is injectable so tests avoid real delay (§4.13).
    pub fn retry_transition(
        &self,
        ctx: LifecycleContext,
        to: LifecycleState,
        now: &str,
        max_attempts: u32,
        sleep_fn: impl Fn(Duration),
    ) -> Result<LifecycleContext, LifecycleError> {
        let mut last_err = None;
        for attempt in 0..max_attempts {
            match self.transition(ctx.clone(), to, now) {
                Ok(updated) => return Ok(updated),
                Err(err) => {
                    last_err = Some(err);
                    sleep_fn(Duration::from_secs(2u64.pow(attempt)));
                }
            }
        }
        Err(last_err.unwrap())
    }
}

/// No-op sleep function for tests.
pub fn no_sleep(_: Duration) {}

/// Canonical digest of the rollback-sensitive slice of a context (§4.13).
fn state_digest(ctx: &LifecycleContext) -> String {
    let material = serde_json::json!({
        "current_state": ctx.current_state,
        "stage_timestamps": ctx.stage_timestamps,
        "cert_refs": ctx.cert_refs,
    });
    sha256_prefixed_digest(&material)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cryovant::DevSignaturePredicate;

    fn setup() -> (tempfile::TempDir, LineageLedger, CryovantJournal) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = LineageLedger::open(dir.path().join("lineage.jsonl")).unwrap();
        let journal = CryovantJournal::open(dir.path().join("journal.jsonl"), None).unwrap();
        (dir, ledger, journal)
    }

    fn context() -> LifecycleContext {
        LifecycleContext {
            mutation_id: "mut-1".to_string(),
            agent_id: "alpha".to_string(),
            epoch_id: "epoch-1".to_string(),
            signature: "cryovant-dev-alpha".to_string(),
            trust_mode: TrustMode::Dev,
            cert_refs: vec![],
            fitness_score: 0.9,
            fitness_threshold: 0.5,
            founders_law_result: None,
            stage_timestamps: BTreeMap::new(),
            current_state: LifecycleState::Proposed,
        }
    }

    #[test]
    fn proposed_to_staged_succeeds() {
        let (dir, ledger, journal) = setup();
        let predicate = DevSignaturePredicate;
        let engine = LifecycleEngine::new(&ledger, &journal, &predicate, dir.path());
        let ctx = engine
            .transition(context(), LifecycleState::Staged, "2026-01-01T00:00:00Z")
            .unwrap();
        assert_eq!(ctx.current_state, LifecycleState::Staged);
    }

    #[test]
    fn certified_to_executing_fails_without_cert_refs() {
        let (dir, ledger, journal) = setup();
        let predicate = DevSignaturePredicate;
        let engine = LifecycleEngine::new(&ledger, &journal, &predicate, dir.path());
        let mut ctx = context();
        ctx.current_state = LifecycleState::Certified;
        ctx.cert_refs = vec![];
        let err = engine
            .transition(ctx, LifecycleState::Executing, "2026-01-01T00:00:00Z")
            .unwrap_err();
        assert!(matches!(err, LifecycleError::GuardFailed { .. }));
    }

    #[test]
    fn undeclared_transition_is_rejected() {
        let (dir, ledger, journal) = setup();
        let predicate = DevSignaturePredicate;
        let engine = LifecycleEngine::new(&ledger, &journal, &predicate, dir.path());
        let err = engine
            .transition(context(), LifecycleState::Completed, "2026-01-01T00:00:00Z")
            .unwrap_err();
        assert!(matches!(err, LifecycleError::UndeclaredTransition { .. }));
    }

    #[test]
    fn terminal_state_deletes_context_file() {
        let (dir, ledger, journal) = setup();
        let predicate = DevSignaturePredicate;
        let engine = LifecycleEngine::new(&ledger, &journal, &predicate, dir.path());
        let mut ctx = context();
        ctx.current_state = LifecycleState::Completed;
        ctx.cert_refs = vec!["cert-1".to_string()];
        let ctx = engine
            .transition(ctx, LifecycleState::Pruned, "2026-01-01T00:00:00Z")
            .unwrap();
        assert_eq!(ctx.current_state, LifecycleState::Pruned);
        assert!(!engine.context_path(&ctx.mutation_id).exists());
    }

    #[test]
    fn rollback_from_certified_to_staged_succeeds() {
        let (dir, ledger, journal) = setup();
        let predicate = DevSignaturePredicate;
        let engine = LifecycleEngine::new(&ledger, &journal, &predicate, dir.path());
        let mut ctx = context();
        ctx.current_state = LifecycleState::Certified;
        let ctx = engine
            .rollback(ctx, LifecycleState::Staged, "guard_failed_downstream")
            .unwrap();
        assert_eq!(ctx.current_state, LifecycleState::Staged);
    }

    #[test]
    fn rollback_issues_verifiable_certificate_attached_to_cert_refs() {
        let (dir, ledger, journal) = setup();
        let predicate = DevSignaturePredicate;
        let engine = LifecycleEngine::new(&ledger, &journal, &predicate, dir.path());
        let mut ctx = context();
        ctx.current_state = LifecycleState::Certified;
        let before_refs = ctx.cert_refs.len();
        let ctx = engine
            .rollback(ctx, LifecycleState::Staged, "manual_operator_rollback")
            .unwrap();
        assert_eq!(ctx.cert_refs.len(), before_refs + 1);
        let digest = ctx.cert_refs.last().unwrap();
        assert!(digest.starts_with("sha256:"));
    }

    #[test]
    fn rollback_from_undeclared_pair_is_rejected() {
        let (dir, ledger, journal) = setup();
        let predicate = DevSignaturePredicate;
        let engine = LifecycleEngine::new(&ledger, &journal, &predicate, dir.path());
        let mut ctx = context();
        ctx.current_state = LifecycleState::Proposed;
        let err = engine
            .rollback(ctx, LifecycleState::Completed, "invalid")
            .unwrap_err();
        assert!(matches!(err, LifecycleError::CannotRollbackFrom(_)));
    }
}
