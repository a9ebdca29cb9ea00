//! Typed configuration surface (C19), parsed once from the process
//! environment and threaded explicitly through every component constructor.

use std::env;

use thiserror::Error;

/// Replay strictness mode (§6 `ADAAD_REPLAY_MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayMode {
    /// No determinism enforcement.
    #[default]
    Off,
    /// Deterministic provider required for recovery-tier `audit`.
    Audit,
    /// Deterministic provider required everywhere.
    Strict,
}

impl ReplayMode {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "off" => Ok(ReplayMode::Off),
            "audit" => Ok(ReplayMode::Audit),
            "strict" => Ok(ReplayMode::Strict),
            other => Err(ConfigError::InvalidReplayMode(other.to_string())),
        }
    }
}

/// Import-guard posture (§6 `ADAAD_RUNTIME_IMPORT_GUARD`). Only the
/// path-prefix containment check is meaningful in this port (see DESIGN.md);
/// the variant is still recognized for config-parity with the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImportGuardMode {
    #[default]
    Off,
    Test,
    Strict,
}

impl ImportGuardMode {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "off" => Ok(ImportGuardMode::Off),
            "test" => Ok(ImportGuardMode::Test),
            "strict" => Ok(ImportGuardMode::Strict),
            other => Err(ConfigError::InvalidImportGuard(other.to_string())),
        }
    }
}

/// Classified configuration parse failures (§7).
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("invalid_replay_mode: {0}")]
    InvalidReplayMode(String),
    #[error("invalid_entropy_budget: {0}")]
    InvalidEntropyBudget(String),
    #[error("invalid_import_guard: {0}")]
    InvalidImportGuard(String),
}

/// Process-wide configuration, parsed once and cloned/borrowed into
/// constructors (§4.19). Never re-read ad hoc inside a governance function.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub replay_mode: ReplayMode,
    pub force_deterministic_provider: bool,
    pub disable_mutable_fs: bool,
    pub disable_network: bool,
    pub import_guard: ImportGuardMode,
    pub sovereign_mode_strict: bool,
    pub governor_entropy_budget: Option<u64>,
    pub rollback_signing_key: Option<String>,
    pub evidence_bundle_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            replay_mode: ReplayMode::Off,
            force_deterministic_provider: false,
            disable_mutable_fs: false,
            disable_network: false,
            import_guard: ImportGuardMode::Off,
            sovereign_mode_strict: false,
            governor_entropy_budget: None,
            rollback_signing_key: None,
            evidence_bundle_key: None,
        }
    }
}

impl Config {
    /// Parse configuration from the process environment (§6).
    pub fn from_env() -> Result<Self, ConfigError> {
        let replay_mode = match env::var("ADAAD_REPLAY_MODE") {
            Ok(raw) => ReplayMode::parse(&raw)?,
            Err(_) => ReplayMode::Off,
        };
        let import_guard = match env::var("ADAAD_RUNTIME_IMPORT_GUARD") {
            Ok(raw) => ImportGuardMode::parse(&raw)?,
            Err(_) => ImportGuardMode::Off,
        };
        let force_deterministic_provider = env::var("ADAAD_FORCE_DETERMINISTIC_PROVIDER")
            .map(|v| v == "1")
            .unwrap_or(false);
        let disable_mutable_fs = env::var("ADAAD_DISABLE_MUTABLE_FS")
            .map(|v| v == "1")
            .unwrap_or(false);
        let disable_network = env::var("ADAAD_DISABLE_NETWORK")
            .map(|v| v == "1")
            .unwrap_or(false);
        let sovereign_mode_strict = env::var("ADAAD_SOVEREIGN_MODE")
            .map(|v| v == "strict")
            .unwrap_or(false);
        let governor_entropy_budget = match env::var("ADAAD_GOVERNOR_ENTROPY_BUDGET") {
            Ok(raw) => Some(
                raw.parse::<u64>()
                    .map_err(|_| ConfigError::InvalidEntropyBudget(raw))?,
            ),
            Err(_) => None,
        };
        let rollback_signing_key = env::var("CRYOVANT_ROLLBACK_SIGNING_KEY").ok();
        let evidence_bundle_key = env::var("ADAAD_EVIDENCE_BUNDLE_SIGNING_KEY").ok();
        Ok(Self {
            replay_mode,
            force_deterministic_provider,
            disable_mutable_fs,
            disable_network,
            import_guard,
            sovereign_mode_strict,
            governor_entropy_budget,
            rollback_signing_key,
            evidence_bundle_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_permissive() {
        let cfg = Config::default();
        assert_eq!(cfg.replay_mode, ReplayMode::Off);
        assert!(!cfg.force_deterministic_provider);
    }

    #[test]
    fn rejects_unknown_replay_mode() {
        assert_eq!(
            ReplayMode::parse("chaotic"),
            Err(ConfigError::InvalidReplayMode("chaotic".to_string()))
        );
    }
}
