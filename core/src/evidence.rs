//! Evidence Bundle Builder (C18): deterministic, write-once export bundles
//! spanning an inclusive epoch range (§4.18).

use std::collections::BTreeSet;
use std::path::Path;

use governor_spec::{canonical_json, sha256_prefixed_digest};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

use crate::lineage::{LedgerError, LineageLedger};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("epoch range endpoint not found in ledger: {0}")]
    UnknownEpoch(String),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("bundle fails schema validation: {0:?}")]
    SchemaViolations(Vec<String>),
    #[error("existing export at {path} does not match the newly built bundle bytes")]
    ImmutableExportMismatch { path: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("deterministic filesystem error: {0}")]
    Fs(#[from] crate::fsdet::FsError),
}

/// A single entry contributing to a bundle (§4.18).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleEntry {
    pub epoch_id: String,
    pub kind: String,
    pub sort_key: String,
    pub payload: Value,
}

/// Counts rolled up across a built bundle (§4.18).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSummary {
    pub bundle_count: usize,
    pub sandbox_evidence_count: usize,
    pub replay_proof_count: usize,
    pub high_risk_bundle_count: usize,
}

/// Export metadata attached to a built bundle (§4.18).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub retention: String,
    pub access_scope: String,
    pub signature: String,
}

/// A complete evidence bundle (§4.18).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub schema_version: String,
    pub bundle_id: String,
    pub epoch_start: String,
    pub epoch_end: String,
    pub entries: Vec<BundleEntry>,
    pub lineage_anchors: Vec<LineageAnchor>,
    pub risk_summaries: RiskSummary,
    pub digest: String,
    pub export: ExportMetadata,
}

/// Expected vs. recomputed digest for one epoch in the range (§4.18).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct LineageAnchor {
    pub epoch_id: String,
    pub expected_digest: String,
    pub incremental_digest: String,
}

const SCHEMA_VERSION: &str = "1.0";

fn resolve_signing_secret() -> String {
    std::env::var("CRYOVANT_EVIDENCE_SIGNING_KEY")
        .unwrap_or_else(|_| "cryovant-evidence-dev-secret".to_string())
}

fn sign_bundle_id(bundle_id: &str) -> String {
    let secret = resolve_signing_secret();
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(bundle_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Build an evidence bundle covering `[epoch_start, epoch_end]` inclusive
/// (§4.18).
pub fn build_bundle(
    ledger: &LineageLedger,
    epoch_start: &str,
    epoch_end: &str,
    retention: &str,
    access_scope: &str,
) -> Result<EvidenceBundle, EvidenceError> {
    let known_epochs: BTreeSet<String> = ledger.list_epoch_ids()?.into_iter().collect();
    if !known_epochs.contains(epoch_start) {
        return Err(EvidenceError::UnknownEpoch(epoch_start.to_string()));
    }
    if !known_epochs.contains(epoch_end) {
        return Err(EvidenceError::UnknownEpoch(epoch_end.to_string()));
    }

    let in_range: Vec<&String> = known_epochs
        .iter()
        .filter(|id| id.as_str() >= epoch_start && id.as_str() <= epoch_end)
        .collect();

    let mut entries = Vec::new();
    let mut lineage_anchors = Vec::new();
    let mut sandbox_evidence_count = 0usize;
    let mut replay_proof_count = 0usize;
    let mut high_risk_bundle_count = 0usize;

    for epoch_id in &in_range {
        let events = ledger.read_epoch(epoch_id)?;
        let mut expected_digest = String::new();
        for line in &events {
            match line.event_type.as_str() {
                "MutationBundleEvent" => {
                    let sort_key = line
                        .payload
                        .get("bundle_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    if matches!(
                        line.payload.get("risk_tier").and_then(Value::as_str),
                        Some("high") | Some("critical")
                    ) {
                        high_risk_bundle_count += 1;
                    }
                    if let Some(digest) = line.payload.get("epoch_digest").and_then(Value::as_str) {
                        expected_digest = digest.to_string();
                    }
                    entries.push(BundleEntry {
                        epoch_id: epoch_id.to_string(),
                        kind: "bundle".to_string(),
                        sort_key,
                        payload: line.payload.clone(),
                    });
                }
                "SandboxEvidenceEvent" => {
                    sandbox_evidence_count += 1;
                    let sort_key = line
                        .payload
                        .get("evidence_hash")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    entries.push(BundleEntry {
                        epoch_id: epoch_id.to_string(),
                        kind: "sandbox_evidence".to_string(),
                        sort_key,
                        payload: line.payload.clone(),
                    });
                }
                "ReplayVerificationEvent" => {
                    replay_proof_count += 1;
                    let sort_key = line
                        .payload
                        .get("replay_digest")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    entries.push(BundleEntry {
                        epoch_id: epoch_id.to_string(),
                        kind: "replay_proof".to_string(),
                        sort_key,
                        payload: line.payload.clone(),
                    });
                }
                _ => {}
            }
        }
        let incremental_digest = ledger.expected_epoch_digest(epoch_id);
        lineage_anchors.push(LineageAnchor {
            epoch_id: epoch_id.to_string(),
            expected_digest,
            incremental_digest,
        });
    }

    entries.sort_by(|a, b| (&a.epoch_id, &a.kind, &a.sort_key).cmp(&(&b.epoch_id, &b.kind, &b.sort_key)));
    lineage_anchors.sort();

    let risk_summaries = RiskSummary {
        bundle_count: entries.iter().filter(|e| e.kind == "bundle").count(),
        sandbox_evidence_count,
        replay_proof_count,
        high_risk_bundle_count,
    };

    let pre_digest_material = serde_json::json!({
        "schema_version": SCHEMA_VERSION,
        "epoch_start": epoch_start,
        "epoch_end": epoch_end,
        "entries": entries,
        "lineage_anchors": lineage_anchors,
        "risk_summaries": risk_summaries,
    });
    let digest = sha256_prefixed_digest(&pre_digest_material);
    let bundle_id = format!("evidence-{}", &digest[7..23]);
    let export = ExportMetadata {
        retention: retention.to_string(),
        access_scope: access_scope.to_string(),
        signature: sign_bundle_id(&bundle_id),
    };

    let bundle = EvidenceBundle {
        schema_version: SCHEMA_VERSION.to_string(),
        bundle_id,
        epoch_start: epoch_start.to_string(),
        epoch_end: epoch_end.to_string(),
        entries,
        lineage_anchors,
        risk_summaries,
        digest,
        export,
    };

    let violations = validate_bundle(&bundle);
    if !violations.is_empty() {
        return Err(EvidenceError::SchemaViolations(violations));
    }

    Ok(bundle)
}

/// Validate `bundle` against a compact local schema subset, collecting every
/// violation instead of stopping at the first (§4.18).
fn validate_bundle(bundle: &EvidenceBundle) -> Vec<String> {
    let mut violations = Vec::new();
    if bundle.schema_version.is_empty() {
        violations.push("missing:schema_version".to_string());
    }
    if bundle.bundle_id.is_empty() {
        violations.push("missing:bundle_id".to_string());
    }
    if bundle.epoch_start.is_empty() {
        violations.push("missing:epoch_start".to_string());
    }
    if bundle.epoch_end.is_empty() {
        violations.push("missing:epoch_end".to_string());
    }
    if bundle.epoch_start > bundle.epoch_end {
        violations.push("invalid:epoch_range_order".to_string());
    }
    if bundle.export.signature.is_empty() {
        violations.push("missing:export.signature".to_string());
    }
    violations.sort();
    violations
}

/// Export `bundle` to `path`, enforcing write-once immutability: if a file
/// already exists there, its bytes must match the freshly canonicalized
/// bundle exactly (§4.18).
pub fn export_bundle(bundle: &EvidenceBundle, path: &Path) -> Result<(), EvidenceError> {
    let canonical = canonical_json(bundle);
    if path.exists() {
        let existing = crate::fsdet::read_file_deterministic(path)?;
        if existing != canonical.as_bytes() {
            return Err(EvidenceError::ImmutableExportMismatch {
                path: path.display().to_string(),
            });
        }
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    crate::fsdet::write_file_deterministic(path, canonical.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_epochs(dir: &Path) -> LineageLedger {
        let ledger = LineageLedger::open(dir.join("lineage.jsonl")).unwrap();
        ledger
            .append_event(
                "EpochStartEvent",
                serde_json::json!({"epoch_id": "epoch-1", "ts": "2026-01-01T00:00:00Z"}),
            )
            .unwrap();
        ledger
            .append_bundle_with_digest(
                "epoch-1",
                serde_json::json!({"epoch_id": "epoch-1", "bundle_id": "bundle-1", "risk_tier": "high"}),
            )
            .unwrap();
        ledger
            .append_event(
                "SandboxEvidenceEvent",
                serde_json::json!({"epoch_id": "epoch-1", "evidence_hash": "sha256:abc"}),
            )
            .unwrap();
        ledger
    }

    #[test]
    fn builds_bundle_with_deterministic_id() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_with_epochs(dir.path());
        let bundle = build_bundle(&ledger, "epoch-1", "epoch-1", "90d", "governor-only").unwrap();
        assert!(bundle.bundle_id.starts_with("evidence-"));
        assert_eq!(bundle.risk_summaries.bundle_count, 1);
        assert_eq!(bundle.risk_summaries.sandbox_evidence_count, 1);
        assert_eq!(bundle.risk_summaries.high_risk_bundle_count, 1);
    }

    #[test]
    fn unknown_epoch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_with_epochs(dir.path());
        let err = build_bundle(&ledger, "epoch-1", "epoch-9", "90d", "governor-only").unwrap_err();
        assert!(matches!(err, EvidenceError::UnknownEpoch(_)));
    }

    #[test]
    fn export_is_idempotent_for_matching_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_with_epochs(dir.path());
        let bundle = build_bundle(&ledger, "epoch-1", "epoch-1", "90d", "governor-only").unwrap();
        let export_path = dir.path().join("export.json");
        export_bundle(&bundle, &export_path).unwrap();
        export_bundle(&bundle, &export_path).unwrap();
    }

    #[test]
    fn export_rejects_mismatched_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger_with_epochs(dir.path());
        let bundle = build_bundle(&ledger, "epoch-1", "epoch-1", "90d", "governor-only").unwrap();
        let export_path = dir.path().join("export.json");
        std::fs::write(&export_path, "not the bundle").unwrap();
        let err = export_bundle(&bundle, &export_path).unwrap_err();
        assert!(matches!(err, EvidenceError::ImmutableExportMismatch { .. }));
    }
}
