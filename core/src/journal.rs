//! Cryovant Journal (C6): a second hash-chained append-only log with a
//! persisted tail-state cache, genesis seeding, and combined process+thread
//! locking (§4.6).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use governor_spec::{chain_hash, ZERO_HASH_HEX};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One journal line (§6): `{tx, ts, type, payload, prev_hash, hash}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalLine {
    pub tx: String,
    pub ts: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub prev_hash: String,
    pub hash: String,
}

/// Persisted `{last_hash, offset}` tail-state cache (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct TailState {
    last_hash: String,
    offset: u64,
}

/// Classified journal integrity errors (§7).
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal_invalid_json: {0}")]
    InvalidJson(String),
    #[error("journal_prev_hash_mismatch at line {index}")]
    PrevHashMismatch { index: usize },
    #[error("journal_hash_mismatch at line {index}")]
    HashMismatch { index: usize },
    #[error("recovery hook reported no valid snapshot for `{path}`")]
    RecoveryFailed { path: PathBuf },
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
    #[error("deterministic filesystem error: {0}")]
    Fs(#[from] crate::fsdet::FsError),
}

/// Invoked with the offending path and the classified error before it
/// propagates to the caller, so a snapshot restore can be attempted (§4.6).
pub trait JournalRecoveryHook: Send + Sync {
    /// Attempt recovery; return `true` if the journal file was restored to a
    /// valid state and the caller should retry verification.
    fn recover(&self, path: &Path, error: &JournalError) -> bool;
}

/// A recovery hook that never recovers anything; the default when no
/// snapshot mechanism is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecoveryHook;

impl JournalRecoveryHook for NoopRecoveryHook {
    fn recover(&self, _path: &Path, _error: &JournalError) -> bool {
        false
    }
}

/// Hash-chained journal with genesis seeding and an incrementally verified
/// tail-state cache (§4.6).
pub struct CryovantJournal {
    path: PathBuf,
    tail_path: PathBuf,
    lock_path: PathBuf,
    thread_lock: Mutex<()>,
    recovery_hook: Box<dyn JournalRecoveryHook>,
}

impl CryovantJournal {
    /// Open the journal at `path`, seeding from `genesis_path` if `path`
    /// does not exist yet and a genesis file is given.
    pub fn open(
        path: impl Into<PathBuf>,
        genesis_path: Option<&Path>,
    ) -> Result<Self, JournalError> {
        let path = path.into();
        if !path.exists() {
            match genesis_path {
                Some(genesis) if genesis.exists() => {
                    fs::copy(genesis, &path)
                        .map_err(|e| anyhow::Error::new(e).context("seed journal from genesis"))?;
                }
                _ => {
                    File::create(&path)
                        .map_err(|e| anyhow::Error::new(e).context("create journal file"))?;
                }
            }
        }
        let tail_path = tail_state_path(&path);
        let lock_path = lock_file_path(&path);
        let journal = Self {
            path,
            tail_path,
            lock_path,
            thread_lock: Mutex::new(()),
            recovery_hook: Box::new(NoopRecoveryHook),
        };
        journal.verify_from_cache_or_full()?;
        Ok(journal)
    }

    /// Replace the recovery hook.
    pub fn with_recovery_hook(mut self, hook: Box<dyn JournalRecoveryHook>) -> Self {
        self.recovery_hook = hook;
        self
    }

    /// Append one journal entry, chaining it onto the tail. Acquires the
    /// combined OS file lock and process-local thread lock for the duration
    /// of the read-modify-write window (§4.6, §5).
    pub fn append(&self, tx: &str, ts: &str, event_type: &str, payload: Value) -> Result<JournalLine, JournalError> {
        let span = tracing::info_span!("journal_append", tx, event_type, latency_ms = tracing::field::Empty);
        let _enter = span.enter();
        let started = std::time::Instant::now();

        let _thread_guard = self.thread_lock.lock();
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| anyhow::Error::new(e).context("open journal lock file"))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| anyhow::Error::new(e).context("acquire journal file lock"))?;

        let result = (|| {
            let tail = self.load_tail_state()?;
            let unhashed = serde_json::json!({
                "tx": tx, "ts": ts, "type": event_type, "payload": payload, "prev_hash": tail.last_hash,
            });
            let hash = chain_hash(&tail.last_hash, &unhashed);
            let line = JournalLine {
                tx: tx.to_string(),
                ts: ts.to_string(),
                event_type: event_type.to_string(),
                payload,
                prev_hash: tail.last_hash.clone(),
                hash: hash.clone(),
            };
            let bytes_written = append_line(&self.path, &line)?;
            self.save_tail_state(&TailState {
                last_hash: hash,
                offset: tail.offset + bytes_written,
            })?;
            Ok(line)
        })();

        let _ = lock_file.unlock();
        match &result {
            Ok(_) => {
                span.record("latency_ms", started.elapsed().as_millis() as u64);
                tracing::debug!("journal append committed");
            }
            Err(err) => tracing::error!(error = %err, "journal append failed"),
        }
        result
    }

    /// Verify incrementally from the cached tail offset; on any mismatch
    /// (corrupt cache, truncated file) fall back to a full rescan (§4.6).
    fn verify_from_cache_or_full(&self) -> Result<(), JournalError> {
        match self.try_verify_incremental() {
            Ok(()) => Ok(()),
            Err(_) => self.verify_full(),
        }
    }

    fn try_verify_incremental(&self) -> Result<(), JournalError> {
        let tail = self.load_tail_state()?;
        let lines = read_all_lines(&self.path)?;
        let consumed: u64 = lines
            .iter()
            .map(|l| serde_json::to_string(l).unwrap_or_default().len() as u64 + 1)
            .sum();
        if consumed != tail.offset {
            return Err(JournalError::InvalidJson("tail cache offset mismatch".to_string()));
        }
        if lines.last().map(|l| l.hash.clone()).unwrap_or_else(|| ZERO_HASH_HEX.to_string())
            != tail.last_hash
        {
            return Err(JournalError::InvalidJson("tail cache hash mismatch".to_string()));
        }
        Ok(())
    }

    fn verify_full(&self) -> Result<(), JournalError> {
        let lines = read_all_lines(&self.path)?;
        let mut tail = ZERO_HASH_HEX.to_string();
        for (index, line) in lines.iter().enumerate() {
            if let Err(err) = verify_line(line, &tail, index) {
                if self.recovery_hook.recover(&self.path, &err) {
                    return self.verify_full();
                }
                return Err(err);
            }
            tail = line.hash.clone();
        }
        self.save_tail_state(&TailState {
            last_hash: tail,
            offset: fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
        })
    }

    fn load_tail_state(&self) -> Result<TailState, JournalError> {
        if !self.tail_path.exists() {
            return Ok(TailState {
                last_hash: ZERO_HASH_HEX.to_string(),
                offset: 0,
            });
        }
        let raw = fs::read_to_string(&self.tail_path)
            .map_err(|e| anyhow::Error::new(e).context("read tail state"))?;
        serde_json::from_str(&raw).map_err(|e| JournalError::InvalidJson(e.to_string()))
    }

    fn save_tail_state(&self, state: &TailState) -> Result<(), JournalError> {
        let tmp = self.tail_path.with_extension("tmp");
        let json = serde_json::to_string(state).map_err(anyhow::Error::new)?;
        fs::write(&tmp, json).map_err(|e| anyhow::Error::new(e).context("write tail state tmp"))?;
        fs::rename(&tmp, &self.tail_path)
            .map_err(|e| anyhow::Error::new(e).context("rename tail state"))?;
        Ok(())
    }

    /// Current tail hash.
    pub fn tail_hash(&self) -> Result<String, JournalError> {
        Ok(self.load_tail_state()?.last_hash)
    }
}

fn tail_state_path(journal_path: &Path) -> PathBuf {
    journal_path.with_extension("tail.json")
}

fn lock_file_path(journal_path: &Path) -> PathBuf {
    journal_path.with_extension("lock")
}

fn verify_line(line: &JournalLine, expected_prev: &str, index: usize) -> Result<(), JournalError> {
    if line.prev_hash != expected_prev {
        return Err(JournalError::PrevHashMismatch { index });
    }
    let unhashed = serde_json::json!({
        "tx": line.tx, "ts": line.ts, "type": line.event_type, "payload": line.payload, "prev_hash": line.prev_hash,
    });
    if line.hash != chain_hash(&line.prev_hash, &unhashed) {
        return Err(JournalError::HashMismatch { index });
    }
    Ok(())
}

fn read_all_lines(path: &Path) -> Result<Vec<JournalLine>, JournalError> {
    let bytes = crate::fsdet::read_file_deterministic(path)?;
    let contents = String::from_utf8(bytes)
        .map_err(|e| JournalError::InvalidJson(format!("non-utf8 journal contents: {e}")))?;
    let mut out = Vec::new();
    for raw in contents.lines() {
        if raw.trim().is_empty() {
            continue;
        }
        out.push(
            serde_json::from_str(raw).map_err(|e| JournalError::InvalidJson(e.to_string()))?,
        );
    }
    Ok(out)
}

fn append_line(path: &Path, line: &JournalLine) -> Result<u64, JournalError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::Error::new(e).context("open journal for append"))?;
    let mut json = serde_json::to_string(line).map_err(anyhow::Error::new)?;
    let len = json.len() as u64 + 1;
    json.push('\n');
    file.write_all(json.as_bytes())
        .map_err(|e| anyhow::Error::new(e).context("write journal line"))?;
    file.flush().map_err(|e| anyhow::Error::new(e).context("flush journal"))?;
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_reopen_recovers_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let hash = {
            let journal = CryovantJournal::open(&path, None).unwrap();
            journal
                .append("TX-Lifecycle-20260101T000000Z", "2026-01-01T00:00:00Z", "LifecycleTransition", serde_json::json!({}))
                .unwrap()
                .hash
        };
        let reopened = CryovantJournal::open(&path, None).unwrap();
        assert_eq!(reopened.tail_hash().unwrap(), hash);
    }

    #[test]
    fn genesis_seeds_new_journal() {
        let dir = tempfile::tempdir().unwrap();
        let genesis = dir.path().join("genesis.jsonl");
        let journal = CryovantJournal::open(dir.path().join("seed-source.jsonl"), None).unwrap();
        journal
            .append("TX-Seed-1", "2026-01-01T00:00:00Z", "Seed", serde_json::json!({}))
            .unwrap();
        fs::copy(dir.path().join("seed-source.jsonl"), &genesis).unwrap();

        let target = dir.path().join("fresh.jsonl");
        let seeded = CryovantJournal::open(&target, Some(&genesis)).unwrap();
        assert_ne!(seeded.tail_hash().unwrap(), ZERO_HASH_HEX);
    }

    #[test]
    fn detects_tamper_on_full_rescan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        {
            let journal = CryovantJournal::open(&path, None).unwrap();
            journal
                .append("TX-A", "2026-01-01T00:00:00Z", "A", serde_json::json!({}))
                .unwrap();
        }
        let contents = fs::read_to_string(&path).unwrap();
        fs::write(&path, contents.replace('A', "B")).unwrap();
        fs::remove_file(tail_state_path(&path)).ok();
        assert!(CryovantJournal::open(&path, None).is_err());
    }
}
