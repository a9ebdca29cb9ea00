//! Lineage Ledger v2 (C5): an append-only JSONL event log with a per-line
//! hash chain and an incrementally maintained epoch digest (§4.5).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use governor_spec::{chain_hash, sha256_prefixed_digest, ZERO_HASH_HEX};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::field::Empty;

/// One stored ledger line: `{type, payload, prev_hash, hash}` (§6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerLine {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub prev_hash: String,
    pub hash: String,
}

/// Classified integrity/storage failures (§7).
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("lineage_invalid_json: {0}")]
    InvalidJson(String),
    #[error("lineage_malformed_entry: {0}")]
    MalformedEntry(String),
    #[error("lineage_prev_hash_mismatch at line {index}")]
    PrevHashMismatch { index: usize },
    #[error("lineage_hash_mismatch at line {index}")]
    HashMismatch { index: usize },
    #[error("appends blocked: prior integrity failure")]
    AppendsBlocked,
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
    #[error("deterministic filesystem error: {0}")]
    Fs(#[from] crate::fsdet::FsError),
}

struct LedgerState {
    tail_hash: String,
    /// epoch_id -> running epoch digest.
    epoch_digests: std::collections::HashMap<String, String>,
    appends_blocked: bool,
}

/// Append-only, hash-chained event ledger backed by a single JSONL file.
/// Exclusively owns its file handle and tail-hash cache; no other component
/// may append to it (§3 Ownership).
pub struct LineageLedger {
    path: PathBuf,
    state: RwLock<LedgerState>,
}

impl LineageLedger {
    /// Open (creating if absent) the ledger file at `path`, scanning it once
    /// to recover the tail hash and per-epoch digest cache.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if !path.exists() {
            File::create(&path).map_err(|e| anyhow::Error::new(e).context("create ledger file"))?;
        }
        let lines = read_all_lines(&path)?;
        let mut tail_hash = ZERO_HASH_HEX.to_string();
        let mut epoch_digests = std::collections::HashMap::new();
        for (index, line) in lines.iter().enumerate() {
            verify_line(line, &tail_hash, index)?;
            tail_hash = line.hash.clone();
            if line.event_type == "MutationBundleEvent" {
                if let (Some(epoch_id), Some(epoch_digest)) = (
                    line.payload.get("epoch_id").and_then(Value::as_str),
                    line.payload.get("epoch_digest").and_then(Value::as_str),
                ) {
                    epoch_digests.insert(epoch_id.to_string(), epoch_digest.to_string());
                }
            }
        }
        Ok(Self {
            path,
            state: RwLock::new(LedgerState {
                tail_hash,
                epoch_digests,
                appends_blocked: false,
            }),
        })
    }

    /// Append a typed event, hash-chaining it onto the tail (§4.5 step 1-3).
    pub fn append_event(&self, event_type: &str, payload: Value) -> Result<LedgerLine, LedgerError> {
        let span = tracing::info_span!("lineage_append", event_type, latency_ms = Empty);
        let _enter = span.enter();
        let started = std::time::Instant::now();

        let mut state = self.state.write();
        if state.appends_blocked {
            return Err(LedgerError::AppendsBlocked);
        }
        let unhashed = serde_json::json!({
            "type": event_type,
            "payload": payload,
            "prev_hash": state.tail_hash,
        });
        let hash = chain_hash(&state.tail_hash, &unhashed);
        let line = LedgerLine {
            event_type: event_type.to_string(),
            payload,
            prev_hash: state.tail_hash.clone(),
            hash: hash.clone(),
        };
        match append_line_to_file(&self.path, &line) {
            Ok(()) => {
                state.tail_hash = hash;
                span.record("latency_ms", started.elapsed().as_millis() as u64);
                tracing::debug!("append committed");
                Ok(line)
            }
            Err(err) => {
                tracing::error!(error = %err, "append failed");
                Err(err)
            }
        }
    }

    /// Append a `MutationBundleEvent`, chaining the epoch digest per §3/§4.5.
    pub fn append_bundle_with_digest(
        &self,
        epoch_id: &str,
        mut bundle_payload: Value,
    ) -> Result<(LedgerLine, String), LedgerError> {
        let prev_epoch_digest = self.expected_epoch_digest(epoch_id);
        let bundle_digest = sha256_prefixed_digest(&bundle_payload);
        let epoch_digest = format!(
            "sha256:{}",
            governor_spec::sha256_hex(format!("{prev_epoch_digest}{bundle_digest}").as_bytes())
        );
        if let Value::Object(map) = &mut bundle_payload {
            map.insert("epoch_id".to_string(), Value::String(epoch_id.to_string()));
            map.insert(
                "bundle_digest".to_string(),
                Value::String(bundle_digest.clone()),
            );
            map.insert(
                "epoch_digest".to_string(),
                Value::String(epoch_digest.clone()),
            );
        }
        let line = self.append_event("MutationBundleEvent", bundle_payload)?;
        self.state
            .write()
            .epoch_digests
            .insert(epoch_id.to_string(), epoch_digest.clone());
        Ok((line, epoch_digest))
    }

    /// Cached expected epoch digest, or `sha256:0` for an epoch with no
    /// accepted bundles yet (§8 boundary behavior).
    pub fn expected_epoch_digest(&self, epoch_id: &str) -> String {
        self.state
            .read()
            .epoch_digests
            .get(epoch_id)
            .cloned()
            .unwrap_or_else(|| "sha256:0".to_string())
    }

    /// Re-derive an epoch's digest from scratch by replaying its
    /// `MutationBundleEvent`s in file order (§4.5 canonical digest choice).
    pub fn compute_incremental_epoch_digest(&self, epoch_id: &str) -> Result<String, LedgerError> {
        let mut digest = "sha256:0".to_string();
        for line in self.read_all()? {
            if line.event_type != "MutationBundleEvent" {
                continue;
            }
            if line.payload.get("epoch_id").and_then(Value::as_str) != Some(epoch_id) {
                continue;
            }
            let mut bundle_payload = line.payload.clone();
            if let Value::Object(map) = &mut bundle_payload {
                map.remove("epoch_id");
                map.remove("bundle_digest");
                map.remove("epoch_digest");
            }
            let bundle_digest = sha256_prefixed_digest(&bundle_payload);
            digest = format!(
                "sha256:{}",
                governor_spec::sha256_hex(format!("{digest}{bundle_digest}").as_bytes())
            );
        }
        Ok(digest)
    }

    /// Read every line belonging to `epoch_id`, in append order.
    pub fn read_epoch(&self, epoch_id: &str) -> Result<Vec<LedgerLine>, LedgerError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|line| line.payload.get("epoch_id").and_then(Value::as_str) == Some(epoch_id))
            .collect())
    }

    /// Distinct epoch ids observed in the ledger, sorted.
    pub fn list_epoch_ids(&self) -> Result<Vec<String>, LedgerError> {
        let mut ids: Vec<String> = self
            .read_all()?
            .into_iter()
            .filter_map(|line| {
                line.payload
                    .get("epoch_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Re-scan the whole file and verify every hash-chain link (§4.5).
    pub fn verify_integrity(&self) -> Result<(), LedgerError> {
        let lines = read_all_lines(&self.path)?;
        let mut tail = ZERO_HASH_HEX.to_string();
        for (index, line) in lines.iter().enumerate() {
            if let Err(err) = verify_line(line, &tail, index) {
                self.state.write().appends_blocked = true;
                return Err(err);
            }
            tail = line.hash.clone();
        }
        Ok(())
    }

    /// Read the current tail hash, `ZERO_HASH_HEX` for an empty ledger.
    pub fn tail_hash(&self) -> String {
        self.state.read().tail_hash.clone()
    }

    /// Read every line in the ledger, across all epochs, in append order.
    pub fn read_all_events(&self) -> Result<Vec<LedgerLine>, LedgerError> {
        self.read_all()
    }

    fn read_all(&self) -> Result<Vec<LedgerLine>, LedgerError> {
        read_all_lines(&self.path)
    }
}

fn verify_line(line: &LedgerLine, expected_prev: &str, index: usize) -> Result<(), LedgerError> {
    if line.prev_hash != expected_prev {
        return Err(LedgerError::PrevHashMismatch { index });
    }
    let unhashed = serde_json::json!({
        "type": line.event_type,
        "payload": line.payload,
        "prev_hash": line.prev_hash,
    });
    let expected_hash = chain_hash(&line.prev_hash, &unhashed);
    if line.hash != expected_hash {
        return Err(LedgerError::HashMismatch { index });
    }
    Ok(())
}

fn read_all_lines(path: &Path) -> Result<Vec<LedgerLine>, LedgerError> {
    let bytes = crate::fsdet::read_file_deterministic(path)?;
    let contents = String::from_utf8(bytes)
        .map_err(|e| LedgerError::InvalidJson(format!("non-utf8 ledger contents: {e}")))?;
    let mut out = Vec::new();
    for raw in contents.lines() {
        if raw.trim().is_empty() {
            continue;
        }
        let line: LedgerLine = serde_json::from_str(raw)
            .map_err(|e| LedgerError::InvalidJson(e.to_string()))?;
        out.push(line);
    }
    Ok(out)
}

fn append_line_to_file(path: &Path, line: &LedgerLine) -> Result<(), LedgerError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::Error::new(e).context("open ledger for append"))?;
    let mut json = serde_json::to_string(line).map_err(|e| anyhow::Error::new(e))?;
    json.push('\n');
    file.write_all(json.as_bytes())
        .map_err(|e| anyhow::Error::new(e).context("write ledger line"))?;
    file.flush()
        .map_err(|e| anyhow::Error::new(e).context("flush ledger"))?;
    Ok(())
}
