//! Capability Graph (C7): a monotonic-score capability registry with
//! dependency enforcement and optimistic-concurrency retry (§4.7).

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use governor_spec::sha256_hex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const MAX_RETRIES: u32 = 5;

/// One capability's registered state (§4.7, §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityRecord {
    pub name: String,
    pub version: String,
    pub score: f64,
    pub owner: String,
    pub requires: Vec<String>,
    pub evidence: Value,
    pub updated_at: String,
}

/// Classified capability registration outcomes (§7).
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("missing dependencies for {name}: {missing:?}")]
    MissingDependencies { name: String, missing: Vec<String> },
    #[error("score regression prevented for {name}")]
    ScoreRegression { name: String },
    #[error("conflict retries exhausted for {name}")]
    RetriesExhausted { name: String },
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Outcome of a single registration attempt's retry loop (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    ConflictDetected,
    CommitSuccess,
    RetryExhausted,
}

type Registry = BTreeMap<String, CapabilityRecord>;

/// JSON-file-backed capability registry guarded by a sidecar `.lock` file.
pub struct CapabilityGraph {
    path: PathBuf,
    lock_path: PathBuf,
}

impl CapabilityGraph {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self { path, lock_path }
    }

    /// Register (or update) a capability, enforcing dependency presence and
    /// score monotonicity under an optimistic-concurrency retry loop.
    pub fn register_capability(
        &self,
        name: &str,
        version: &str,
        score: f64,
        owner: &str,
        requires: Vec<String>,
        evidence: Value,
        now: &str,
    ) -> Result<RetryOutcome, CapabilityError> {
        let span = tracing::info_span!("capability_register", name, latency_ms = tracing::field::Empty);
        let _enter = span.enter();
        let started = std::time::Instant::now();

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| anyhow::Error::new(e).context("open capability lock"))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| anyhow::Error::new(e).context("acquire capability lock"))?;

        let result = self.register_locked(name, version, score, owner, requires, evidence, now);
        let _ = lock_file.unlock();

        span.record("latency_ms", started.elapsed().as_millis() as u64);
        match &result {
            Ok(outcome) => tracing::debug!(?outcome, "capability_graph_registered"),
            Err(err) => tracing::error!(error = %err, "capability_graph_rejected"),
        }
        result
    }

    fn register_locked(
        &self,
        name: &str,
        version: &str,
        score: f64,
        owner: &str,
        requires: Vec<String>,
        evidence: Value,
        now: &str,
    ) -> Result<RetryOutcome, CapabilityError> {
        for _attempt in 0..MAX_RETRIES {
            let (registry, snapshot_digest) = self.read_registry()?;

            let missing: Vec<String> = requires
                .iter()
                .filter(|dep| !registry.contains_key(*dep))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(CapabilityError::MissingDependencies {
                    name: name.to_string(),
                    missing,
                });
            }
            if let Some(existing) = registry.get(name) {
                if score < existing.score {
                    return Err(CapabilityError::ScoreRegression {
                        name: name.to_string(),
                    });
                }
            }

            let mut updated = registry.clone();
            updated.insert(
                name.to_string(),
                CapabilityRecord {
                    name: name.to_string(),
                    version: version.to_string(),
                    score,
                    owner: owner.to_string(),
                    requires: requires.clone(),
                    evidence: evidence.clone(),
                    updated_at: now.to_string(),
                },
            );

            let (_, current_digest) = self.read_registry()?;
            if current_digest != snapshot_digest {
                tracing::warn!(name, "capability_graph_conflict: conflict_detected");
                continue;
            }
            self.write_registry(&updated)?;
            return Ok(RetryOutcome::CommitSuccess);
        }
        Err(CapabilityError::RetriesExhausted {
            name: name.to_string(),
        })
    }

    fn read_registry(&self) -> Result<(Registry, String), CapabilityError> {
        if !self.path.exists() {
            return Ok((Registry::new(), sha256_hex(b"{}")));
        }
        let raw = fs::read_to_string(&self.path)
            .map_err(|e| anyhow::Error::new(e).context("read capability registry"))?;
        let registry: Registry =
            serde_json::from_str(&raw).map_err(|e| anyhow::Error::new(e).context("parse capability registry"))?;
        Ok((registry, sha256_hex(raw.as_bytes())))
    }

    fn write_registry(&self, registry: &Registry) -> Result<(), CapabilityError> {
        let json = serde_json::to_string_pretty(registry).map_err(anyhow::Error::new)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &json).map_err(|e| anyhow::Error::new(e).context("write registry tmp"))?;
        fs::rename(&tmp, &self.path).map_err(|e| anyhow::Error::new(e).context("rename registry"))?;
        Ok(())
    }

    /// Look up a registered capability by name.
    pub fn get(&self, name: &str) -> Result<Option<CapabilityRecord>, CapabilityError> {
        Ok(self.read_registry()?.0.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> (tempfile::TempDir, CapabilityGraph) {
        let dir = tempfile::tempdir().unwrap();
        let graph = CapabilityGraph::open(dir.path().join("capabilities.json"));
        (dir, graph)
    }

    #[test]
    fn registers_new_capability() {
        let (_dir, graph) = graph();
        let outcome = graph
            .register_capability("alpha", "1.0", 0.5, "owner-1", vec![], Value::Null, "2026-01-01T00:00:00Z")
            .unwrap();
        assert_eq!(outcome, RetryOutcome::CommitSuccess);
        assert_eq!(graph.get("alpha").unwrap().unwrap().score, 0.5);
    }

    #[test]
    fn rejects_missing_dependency() {
        let (_dir, graph) = graph();
        let err = graph
            .register_capability(
                "alpha",
                "1.0",
                0.5,
                "owner-1",
                vec!["beta".to_string()],
                Value::Null,
                "2026-01-01T00:00:00Z",
            )
            .unwrap_err();
        assert!(matches!(err, CapabilityError::MissingDependencies { .. }));
    }

    #[test]
    fn rejects_score_regression() {
        let (_dir, graph) = graph();
        graph
            .register_capability("alpha", "1.0", 0.9, "owner-1", vec![], Value::Null, "2026-01-01T00:00:00Z")
            .unwrap();
        let err = graph
            .register_capability("alpha", "1.1", 0.5, "owner-1", vec![], Value::Null, "2026-01-01T00:00:01Z")
            .unwrap_err();
        assert!(matches!(err, CapabilityError::ScoreRegression { .. }));
    }

    #[test]
    fn satisfied_dependency_registers_successfully() {
        let (_dir, graph) = graph();
        graph
            .register_capability("base", "1.0", 0.5, "owner-1", vec![], Value::Null, "2026-01-01T00:00:00Z")
            .unwrap();
        let outcome = graph
            .register_capability(
                "derived",
                "1.0",
                0.5,
                "owner-1",
                vec!["base".to_string()],
                Value::Null,
                "2026-01-01T00:00:01Z",
            )
            .unwrap();
        assert_eq!(outcome, RetryOutcome::CommitSuccess);
    }
}
