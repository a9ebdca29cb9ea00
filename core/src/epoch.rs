//! Epoch Manager (C10): lifecycle of epochs (start/rotate/end) with
//! deterministic id derivation and persisted state (§4.10).

use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use governor_spec::EpochState;
use parking_lot::RwLock;
use thiserror::Error;

use crate::determinism::DeterminismProvider;
use crate::lineage::{LedgerError, LineageLedger};

/// Default rotation triggers (§4.10).
pub const DEFAULT_MAX_MUTATIONS: u64 = 50;
pub const DEFAULT_MAX_DURATION_MINUTES: i64 = 30;

/// Epoch manager errors.
#[derive(Debug, Error)]
pub enum EpochError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Owns epoch lifecycle state exclusively; the Governor reads but never
/// mutates it (§3 Ownership).
pub struct EpochManager {
    state_path: PathBuf,
    governor_version: String,
    current: RwLock<Option<EpochState>>,
}

impl EpochManager {
    pub fn new(state_path: impl Into<PathBuf>, governor_version: impl Into<String>) -> Self {
        Self {
            state_path: state_path.into(),
            governor_version: governor_version.into(),
            current: RwLock::new(None),
        }
    }

    /// Read persisted epoch state, or start a new epoch if none exists.
    pub fn load_or_create(
        &self,
        ledger: &LineageLedger,
        provider: &dyn DeterminismProvider,
    ) -> Result<EpochState, EpochError> {
        if self.state_path.exists() {
            let raw = fs::read_to_string(&self.state_path)
                .map_err(|e| anyhow::Error::new(e).context("read epoch state"))?;
            let state: EpochState =
                serde_json::from_str(&raw).map_err(|e| anyhow::Error::new(e).context("parse epoch state"))?;
            *self.current.write() = Some(state.clone());
            return Ok(state);
        }
        self.start_new_epoch(ledger, provider, None, serde_json::Value::Null)
    }

    /// Start a new epoch, deriving its id from `(previous_epoch_id, reason)`
    /// when a previous epoch is known, else from the provider alone (§4.10).
    pub fn start_new_epoch(
        &self,
        ledger: &LineageLedger,
        provider: &dyn DeterminismProvider,
        previous_epoch_id: Option<&str>,
        metadata: serde_json::Value,
    ) -> Result<EpochState, EpochError> {
        let span = tracing::info_span!("epoch_start", epoch_id = tracing::field::Empty);
        let _enter = span.enter();

        let now = Utc::now();
        let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
        let reason = metadata
            .get("reason")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("rotation");
        let label = format!("epoch-suffix:{}:{reason}", previous_epoch_id.unwrap_or("genesis"));
        let suffix = provider.next_id(&label, 6);
        let epoch_id = format!("epoch-{timestamp}-{suffix}");
        span.record("epoch_id", epoch_id.as_str());

        let state = EpochState {
            epoch_id: epoch_id.clone(),
            start_ts: now.to_rfc3339(),
            metadata,
            governor_version: self.governor_version.clone(),
            mutation_count: 0,
        };

        ledger.append_event(
            "EpochCheckpointEvent",
            serde_json::json!({"epoch_id": epoch_id, "phase": "start", "start_ts": state.start_ts}),
        )?;
        self.persist(&state)?;
        *self.current.write() = Some(state.clone());
        tracing::debug!(epoch_id = %epoch_id, "epoch started");
        Ok(state)
    }

    /// Close the current epoch and immediately start a new one (§4.10).
    pub fn rotate_epoch(
        &self,
        ledger: &LineageLedger,
        provider: &dyn DeterminismProvider,
        reason: &str,
    ) -> Result<EpochState, EpochError> {
        let previous = self.current.read().clone();
        if let Some(state) = &previous {
            let digest = ledger.expected_epoch_digest(&state.epoch_id);
            ledger.append_event(
                "EpochCheckpointEvent",
                serde_json::json!({
                    "epoch_id": state.epoch_id,
                    "phase": "end",
                    "mutation_count": state.mutation_count,
                    "epoch_digest": digest,
                    "reason": reason,
                }),
            )?;
            tracing::info!(epoch_id = %state.epoch_id, reason, "epoch rotated");
        }
        self.start_new_epoch(
            ledger,
            provider,
            previous.as_ref().map(|s| s.epoch_id.as_str()),
            serde_json::json!({"reason": reason}),
        )
    }

    /// Record that one more mutation was accepted into the current epoch.
    pub fn record_mutation(&self) -> Result<(), EpochError> {
        let mut guard = self.current.write();
        if let Some(state) = guard.as_mut() {
            state.mutation_count += 1;
            drop(guard);
            self.persist(&self.current.read().clone().unwrap())?;
        }
        Ok(())
    }

    /// Whether the current epoch should rotate, given `max_mutations` and
    /// `max_duration_minutes` thresholds (§4.10). Duration is evaluated
    /// against `now`.
    pub fn should_rotate(&self, now: chrono::DateTime<Utc>, max_mutations: u64, max_duration_minutes: i64) -> bool {
        let guard = self.current.read();
        let Some(state) = guard.as_ref() else {
            return false;
        };
        if state.mutation_count >= max_mutations {
            return true;
        }
        match chrono::DateTime::parse_from_rfc3339(&state.start_ts) {
            Ok(start) => (now - start.with_timezone(&Utc)).num_minutes() >= max_duration_minutes,
            Err(_) => false,
        }
    }

    /// The currently active epoch state, if any.
    pub fn current(&self) -> Option<EpochState> {
        self.current.read().clone()
    }

    fn persist(&self, state: &EpochState) -> Result<(), EpochError> {
        let tmp = self.state_path.with_extension("tmp");
        let json = serde_json::to_string_pretty(state).map_err(anyhow::Error::new)?;
        fs::write(&tmp, json).map_err(|e| anyhow::Error::new(e).context("write epoch state tmp"))?;
        fs::rename(&tmp, &self.state_path).map_err(|e| anyhow::Error::new(e).context("rename epoch state"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::determinism::SeededProvider;

    fn setup() -> (tempfile::TempDir, LineageLedger, EpochManager) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = LineageLedger::open(dir.path().join("lineage.jsonl")).unwrap();
        let manager = EpochManager::new(dir.path().join("epoch-state.json"), "0.1.0");
        (dir, ledger, manager)
    }

    #[test]
    fn load_or_create_starts_first_epoch() {
        let (_dir, ledger, manager) = setup();
        let provider = SeededProvider::new("seed");
        let state = manager.load_or_create(&ledger, &provider).unwrap();
        assert!(state.epoch_id.starts_with("epoch-"));
        assert_eq!(state.mutation_count, 0);
    }

    #[test]
    fn reload_recovers_persisted_state() {
        let (_dir, ledger, manager) = setup();
        let provider = SeededProvider::new("seed");
        let first = manager.load_or_create(&ledger, &provider).unwrap();
        let reloaded = manager.load_or_create(&ledger, &provider).unwrap();
        assert_eq!(first.epoch_id, reloaded.epoch_id);
    }

    #[test]
    fn rotation_triggers_on_mutation_count() {
        let (_dir, ledger, manager) = setup();
        let provider = SeededProvider::new("seed");
        manager.load_or_create(&ledger, &provider).unwrap();
        for _ in 0..DEFAULT_MAX_MUTATIONS {
            manager.record_mutation().unwrap();
        }
        assert!(manager.should_rotate(Utc::now(), DEFAULT_MAX_MUTATIONS, DEFAULT_MAX_DURATION_MINUTES));
    }

    #[test]
    fn rotate_epoch_produces_new_id() {
        let (_dir, ledger, manager) = setup();
        let provider = SeededProvider::new("seed");
        let first = manager.load_or_create(&ledger, &provider).unwrap();
        let rotated = manager.rotate_epoch(&ledger, &provider, "forced").unwrap();
        assert_ne!(first.epoch_id, rotated.epoch_id);
    }
}
