//! Mutation Transaction (C14): cross-file atomic apply with guaranteed
//! rollback on scope exit and HMAC-signed rollback certificates (§4.14).

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;

use governor_spec::model::{validate_contained_path, zero_checkpoint_digest};
use governor_spec::{sha256_prefixed_digest, RollbackCertificateBody, TargetType, TargetValidationError};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Transaction/rollback errors (§7).
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error(transparent)]
    Validation(#[from] TargetValidationError),
    #[error("target type `{0:?}` not allowed as a transaction write target")]
    DisallowedTargetType(TargetType),
    #[error("only `.json` targets are allowed, got `{0}`")]
    NonJsonTarget(String),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Rollback certificate verification errors, collected rather than
/// short-circuited (§4.14).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationFault {
    DigestMismatch,
    SignatureDigestLinkMismatch,
    SignatureVerificationFailed,
}

/// HMAC signature envelope attached to a [`RollbackCertificateBody`] (§6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct RollbackSignature {
    pub algorithm: String,
    pub key_id: String,
    pub signed_digest: String,
    pub value: String,
}

/// A fully assembled, signed rollback certificate (§3, §6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct RollbackCertificate {
    pub body: RollbackCertificateBody,
    pub rollback_certificate_digest: String,
    pub signature: RollbackSignature,
}

/// Resolve the HMAC secret for `key_id` via the layered cascade:
/// `specific_env_prefix` → `generic_env_var` → namespaced dev fallback
/// (§4.14, §9).
fn resolve_signing_secret(key_id: &str) -> String {
    if let Ok(v) = env::var(format!("CRYOVANT_ROLLBACK_SIGNING_KEY_{key_id}")) {
        return v;
    }
    if let Ok(v) = env::var("CRYOVANT_ROLLBACK_SIGNING_KEY") {
        return v;
    }
    format!("cryovant-rollback-dev-secret:{key_id}")
}

fn sign_digest(secret: &str, digest: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(digest.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Issue a signed rollback certificate for `body` (§4.14).
pub fn issue_rollback_certificate(body: RollbackCertificateBody, key_id: &str) -> RollbackCertificate {
    let digest = body.digest();
    let secret = resolve_signing_secret(key_id);
    let value = sign_digest(&secret, &digest);
    RollbackCertificate {
        body,
        rollback_certificate_digest: digest.clone(),
        signature: RollbackSignature {
            algorithm: "hmac-sha256".to_string(),
            key_id: key_id.to_string(),
            signed_digest: digest,
            value,
        },
    }
}

/// Re-canonicalize the body, recompute the digest, and verify the
/// signature. `issued_at` is taken verbatim from the certificate, not
/// recomputed (§3, §4.14).
pub fn verify_rollback_certificate(cert: &RollbackCertificate) -> Vec<VerificationFault> {
    let mut faults = Vec::new();
    let recomputed_digest = cert.body.digest();
    if recomputed_digest != cert.rollback_certificate_digest {
        faults.push(VerificationFault::DigestMismatch);
    }
    if cert.signature.signed_digest != cert.rollback_certificate_digest {
        faults.push(VerificationFault::SignatureDigestLinkMismatch);
    }
    let secret = resolve_signing_secret(&cert.signature.key_id);
    let expected_value = sign_digest(&secret, &cert.signature.signed_digest);
    if expected_value != cert.signature.value {
        faults.push(VerificationFault::SignatureVerificationFailed);
    }
    faults
}

struct Backup {
    relative_path: String,
    existed: bool,
    original_bytes: Option<Vec<u8>>,
}

/// Scoped multi-file mutation. Snapshots targets before writing so
/// [`MutationTransaction::rollback`] (explicit or via [`Drop`] on an
/// uncommitted scope) can restore every touched file.
pub struct MutationTransaction {
    agent_id: String,
    agent_root: PathBuf,
    epoch_id: String,
    forward_certificate_digest: String,
    backups: Vec<Backup>,
    created_files: Vec<String>,
    committed: bool,
}

impl MutationTransaction {
    pub fn new(agent_id: impl Into<String>, agent_root: impl Into<PathBuf>, epoch_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_root: agent_root.into(),
            epoch_id: epoch_id.into(),
            forward_certificate_digest: zero_checkpoint_digest(),
            backups: Vec::new(),
            created_files: Vec::new(),
            committed: false,
        }
    }

    fn resolve(&self, relative_path: &str) -> Result<PathBuf, TransactionError> {
        validate_contained_path(relative_path)?;
        if !relative_path.ends_with(".json") {
            return Err(TransactionError::NonJsonTarget(relative_path.to_string()));
        }
        Ok(self.agent_root.join(relative_path))
    }

    /// Apply `new_contents` to `relative_path`, snapshotting the prior state
    /// first (§4.14).
    pub fn apply(
        &mut self,
        relative_path: &str,
        target_type: TargetType,
        new_contents: &serde_json::Value,
    ) -> Result<(), TransactionError> {
        if matches!(target_type, TargetType::Code) {
            return Err(TransactionError::DisallowedTargetType(target_type));
        }
        let full_path = self.resolve(relative_path)?;
        let existed = full_path.exists();
        let original_bytes = if existed {
            Some(fs::read(&full_path).map_err(|e| anyhow::Error::new(e).context("snapshot target"))?)
        } else {
            self.created_files.push(relative_path.to_string());
            None
        };
        self.backups.push(Backup {
            relative_path: relative_path.to_string(),
            existed,
            original_bytes,
        });

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).map_err(|e| anyhow::Error::new(e).context("create target parent dirs"))?;
        }
        let tmp = full_path.with_extension("tmp");
        let body = serde_json::to_vec_pretty(new_contents).map_err(anyhow::Error::new)?;
        fs::write(&tmp, &body).map_err(|e| anyhow::Error::new(e).context("write target tmp"))?;
        fs::rename(&tmp, &full_path).map_err(|e| anyhow::Error::new(e).context("rename target"))?;
        Ok(())
    }

    /// Drop the rollback backups; the transaction's writes stand.
    pub fn commit(mut self) {
        self.committed = true;
    }

    /// Restore every backed-up file, remove any files the transaction
    /// created, and return a signed rollback certificate (§4.14).
    pub fn rollback(&mut self, trigger_reason: &str, actor_class: &str, issued_at: &str) -> Result<RollbackCertificate, TransactionError> {
        let span = tracing::info_span!("mutation_rollback", agent_id = %self.agent_id, epoch_id = %self.epoch_id);
        let _enter = span.enter();

        let prior_state = self.snapshot_current_state()?;
        let mut completeness_checks = BTreeMap::new();
        for backup in &self.backups {
            let full_path = self.agent_root.join(&backup.relative_path);
            match &backup.original_bytes {
                Some(bytes) => {
                    fs::write(&full_path, bytes).map_err(|e| anyhow::Error::new(e).context("restore backup"))?;
                    let restored = fs::read(&full_path).unwrap_or_default();
                    completeness_checks.insert(backup.relative_path.clone(), &restored == bytes);
                }
                None => {
                    let _ = fs::remove_file(&full_path);
                    completeness_checks.insert(backup.relative_path.clone(), !full_path.exists());
                }
            }
        }
        for created in &self.created_files {
            let _ = fs::remove_file(self.agent_root.join(created));
        }
        let restored_state = self.snapshot_current_state()?;

        let body = RollbackCertificateBody {
            schema: RollbackCertificateBody::SCHEMA.to_string(),
            mutation_id: format!("{}:{}", self.agent_id, self.epoch_id),
            epoch_id: self.epoch_id.clone(),
            prior_state_digest: prior_state,
            restored_state_digest: restored_state,
            trigger_reason: trigger_reason.to_string(),
            actor_class: actor_class.to_string(),
            completeness_checks,
            forward_certificate_digest: self.forward_certificate_digest.clone(),
            issued_at: issued_at.to_string(),
        };
        let cert = issue_rollback_certificate(body, &self.agent_id);
        tracing::debug!(digest = %cert.rollback_certificate_digest, "rollback certificate issued");
        Ok(cert)
    }

    fn snapshot_current_state(&self) -> Result<String, TransactionError> {
        let mut files = BTreeMap::new();
        for backup in &self.backups {
            let full_path = self.agent_root.join(&backup.relative_path);
            let contents = fs::read(&full_path).ok().map(hex::encode);
            files.insert(backup.relative_path.clone(), contents);
        }
        Ok(sha256_prefixed_digest(&files))
    }
}

impl Drop for MutationTransaction {
    fn drop(&mut self) {
        if !self.committed && !self.backups.is_empty() {
            let now = "1970-01-01T00:00:00Z";
            if let Err(err) = self.rollback("scope_exit_without_commit", "transaction_guard", now) {
                tracing::error!(error = %err, "auto-rollback on scope exit failed");
            }
        }
    }
}
