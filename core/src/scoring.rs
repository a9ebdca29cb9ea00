//! Scoring Algorithm and Ledger (C17): deterministic, side-effect-free
//! mutation scoring plus a chained append-only scoring log (§4.17).

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;

use governor_spec::{canonical_json, sha256_prefixed_digest, ZERO_HASH};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::determinism::DeterminismProvider;

const MAX_LOC: u64 = 100_000;
const MAX_FILES_TOUCHED: u64 = 1_000;
const MAX_ISSUES: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("loc_added+loc_deleted exceeds bound: {0} > {MAX_LOC}")]
    LocBoundExceeded(u64),
    #[error("files_touched exceeds bound: {0} > {MAX_FILES_TOUCHED}")]
    FilesBoundExceeded(u64),
    #[error("issues exceeds bound: {0} > {MAX_ISSUES}")]
    IssuesBoundExceeded(u64),
    #[error("scoring ledger io error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("scoring ledger has malformed record at line {0}")]
    MalformedRecord(usize),
}

/// A single static-analysis issue contributing to `static_penalty` (§4.17).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Issue {
    pub rule_id: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    fn weight(self) -> u64 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 3,
            Severity::High => 5,
            Severity::Critical => 10,
        }
    }
}

/// Raw scoring input before canonicalization (§4.17).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreInput {
    pub mutation_id: String,
    pub epoch_id: String,
    pub tests_failed: u64,
    pub tests_total: u64,
    pub loc_added: u64,
    pub loc_deleted: u64,
    pub files_touched: u64,
    pub issues: Vec<Issue>,
    pub risk_tags: Vec<String>,
}

fn risk_weight(tag: &str) -> u64 {
    match tag {
        "API" => 30,
        "PERF" => 20,
        "SECURITY" => 50,
        _ => 10,
    }
}

/// Per-component breakdown of a scoring outcome (§4.17).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub test_score: i64,
    pub static_penalty: u64,
    pub diff_penalty: u64,
    pub risk_penalty: u64,
}

/// Result of [`compute_score`] (§4.17).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringResult {
    pub mutation_id: String,
    pub epoch_id: String,
    pub score: i64,
    pub input_hash: String,
    pub algorithm_version: String,
    pub constitution_hash: String,
    pub timestamp: String,
    pub components: ScoreComponents,
}

const ALGORITHM_VERSION: &str = "1.0";

/// Canonicalize `input` (sorted `issues`/`risk_tags`), validate bounds, and
/// compute the final score (§4.17).
pub fn compute_score(
    input: &ScoreInput,
    provider: &dyn DeterminismProvider,
    constitution_hash: &str,
) -> Result<ScoringResult, ScoringError> {
    let loc_total = input.loc_added + input.loc_deleted;
    if loc_total > MAX_LOC {
        return Err(ScoringError::LocBoundExceeded(loc_total));
    }
    if input.files_touched > MAX_FILES_TOUCHED {
        return Err(ScoringError::FilesBoundExceeded(input.files_touched));
    }
    if (input.issues.len() as u64) > MAX_ISSUES {
        return Err(ScoringError::IssuesBoundExceeded(input.issues.len() as u64));
    }

    let mut issues = input.issues.clone();
    issues.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
    let mut risk_tags = input.risk_tags.clone();
    risk_tags.sort();

    let test_score: i64 = if input.tests_failed > 0 {
        0
    } else if input.tests_total > 0 {
        1000
    } else {
        500
    };

    let static_penalty: u64 = issues.iter().map(|issue| 10 * issue.severity.weight()).sum();
    let diff_penalty: u64 = input.loc_added + input.loc_deleted + 5 * input.files_touched;
    let risk_penalty: u64 = risk_tags.iter().map(|tag| risk_weight(tag)).sum();

    let final_score = (test_score - static_penalty as i64 - diff_penalty as i64 - risk_penalty as i64).max(0);

    let hashed_input = serde_json::json!({
        "mutation_id": input.mutation_id,
        "epoch_id": input.epoch_id,
        "tests_failed": input.tests_failed,
        "tests_total": input.tests_total,
        "loc_added": input.loc_added,
        "loc_deleted": input.loc_deleted,
        "files_touched": input.files_touched,
        "issues": issues,
        "risk_tags": risk_tags,
    });
    let input_hash = sha256_prefixed_digest(&hashed_input);
    let timestamp = provider.iso_now();

    Ok(ScoringResult {
        mutation_id: input.mutation_id.clone(),
        epoch_id: input.epoch_id.clone(),
        score: final_score,
        input_hash,
        algorithm_version: ALGORITHM_VERSION.to_string(),
        constitution_hash: constitution_hash.to_string(),
        timestamp,
        components: ScoreComponents {
            test_score,
            static_penalty,
            diff_penalty,
            risk_penalty,
        },
    })
}

/// A single chained line in the scoring ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScoringRecord {
    scoring_result: ScoringResult,
    prev_hash: String,
    record_hash: String,
}

/// Append-only chained log of [`ScoringResult`]s.
pub struct ScoringLedger {
    path: PathBuf,
}

impl ScoringLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tail_hash(&self) -> Result<String, ScoringError> {
        if !self.path.exists() {
            return Ok(ZERO_HASH.to_string());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        match contents.lines().last() {
            Some(line) if !line.trim().is_empty() => {
                let record: ScoringRecord =
                    serde_json::from_str(line).map_err(|_| ScoringError::MalformedRecord(0))?;
                Ok(record.record_hash)
            }
            _ => Ok(ZERO_HASH.to_string()),
        }
    }

    /// Append `result`, chaining `record_hash` from the current tail
    /// (§4.17). Creates the backing file lazily on first append.
    pub fn append(&self, result: ScoringResult) -> Result<String, ScoringError> {
        let span = tracing::info_span!("scoring_ledger_append", mutation_id = %result.mutation_id);
        let _enter = span.enter();

        let prev_hash = self.tail_hash()?;
        let body = serde_json::json!({
            "scoring_result": result,
            "prev_hash": prev_hash,
        });
        let record_hash = sha256_prefixed_digest(&body);
        let record = ScoringRecord {
            scoring_result: result,
            prev_hash,
            record_hash: record_hash.clone(),
        };
        let line = canonical_json(&serde_json::to_value(&record).expect("ScoringRecord serializes"));

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")?;
        tracing::debug!(record_hash = %record_hash, "scoring record appended");
        Ok(record_hash)
    }

    /// Verify that every record's `record_hash` matches its declared
    /// `prev_hash` chain.
    pub fn verify_chain(&self) -> Result<bool, ScoringError> {
        if !self.path.exists() {
            return Ok(true);
        }
        let contents = std::fs::read_to_string(&self.path)?;
        let mut expected_prev = ZERO_HASH.to_string();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: ScoringRecord =
                serde_json::from_str(line).map_err(|_| ScoringError::MalformedRecord(index))?;
            if record.prev_hash != expected_prev {
                return Ok(false);
            }
            let body = serde_json::json!({
                "scoring_result": record.scoring_result,
                "prev_hash": record.prev_hash,
            });
            if sha256_prefixed_digest(&body) != record.record_hash {
                return Ok(false);
            }
            expected_prev = record.record_hash;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::determinism::SeededProvider;

    fn sample_input() -> ScoreInput {
        ScoreInput {
            mutation_id: "mut-1".to_string(),
            epoch_id: "epoch-1".to_string(),
            tests_failed: 0,
            tests_total: 10,
            loc_added: 20,
            loc_deleted: 5,
            files_touched: 2,
            issues: vec![Issue {
                rule_id: "RULE-B".to_string(),
                severity: Severity::High,
            }],
            risk_tags: vec!["SECURITY".to_string(), "API".to_string()],
        }
    }

    #[test]
    fn computes_expected_final_score() {
        let provider = SeededProvider::new("seed-1".to_string());
        let result = compute_score(&sample_input(), &provider, "sha256:constitution").unwrap();
        // test_score=1000, static_penalty=10*5=50, diff_penalty=20+5+10=35, risk_penalty=50+30=80
        assert_eq!(result.components.test_score, 1000);
        assert_eq!(result.components.static_penalty, 50);
        assert_eq!(result.components.diff_penalty, 35);
        assert_eq!(result.components.risk_penalty, 80);
        assert_eq!(result.score, 1000 - 50 - 35 - 80);
    }

    #[test]
    fn failed_tests_zero_the_test_score() {
        let mut input = sample_input();
        input.tests_failed = 2;
        let provider = SeededProvider::new("seed-1".to_string());
        let result = compute_score(&input, &provider, "sha256:constitution").unwrap();
        assert_eq!(result.components.test_score, 0);
        assert_eq!(result.score, 0);
    }

    #[test]
    fn score_never_goes_negative() {
        let mut input = sample_input();
        input.loc_added = 99_000;
        let provider = SeededProvider::new("seed-1".to_string());
        let result = compute_score(&input, &provider, "sha256:constitution").unwrap();
        assert_eq!(result.score, 0);
    }

    #[test]
    fn loc_bound_is_enforced() {
        let mut input = sample_input();
        input.loc_added = 90_000;
        input.loc_deleted = 20_000;
        let provider = SeededProvider::new("seed-1".to_string());
        let err = compute_score(&input, &provider, "sha256:constitution").unwrap_err();
        assert!(matches!(err, ScoringError::LocBoundExceeded(_)));
    }

    #[test]
    fn input_hash_is_order_independent_for_issues_and_tags() {
        let mut input_a = sample_input();
        input_a.issues = vec![
            Issue {
                rule_id: "RULE-B".to_string(),
                severity: Severity::High,
            },
            Issue {
                rule_id: "RULE-A".to_string(),
                severity: Severity::Low,
            },
        ];
        let mut input_b = input_a.clone();
        input_b.issues.reverse();
        let provider = SeededProvider::new("seed-1".to_string());
        let result_a = compute_score(&input_a, &provider, "sha256:constitution").unwrap();
        let result_b = compute_score(&input_b, &provider, "sha256:constitution").unwrap();
        assert_eq!(result_a.input_hash, result_b.input_hash);
    }

    #[test]
    fn ledger_chains_records_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ScoringLedger::new(dir.path().join("scoring.jsonl"));
        let provider = SeededProvider::new("seed-1".to_string());
        let result_a = compute_score(&sample_input(), &provider, "sha256:constitution").unwrap();
        let hash_a = ledger.append(result_a).unwrap();
        let result_b = compute_score(&sample_input(), &provider, "sha256:constitution").unwrap();
        let hash_b = ledger.append(result_b).unwrap();
        assert_ne!(hash_a, hash_b);
        assert!(ledger.verify_chain().unwrap());
    }
}
