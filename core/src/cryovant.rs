//! Cryovant signature predicate (C21): signature verification is an opaque
//! contract in the source this was distilled from (SPEC_FULL.md §9 open
//! question), concrete only for its dev-mode fallback.

/// Verifies a mutation-request or transition signature against some context.
/// Production implementations are out of scope here; only the dev-mode
/// fallback is shipped, matching the behavior every lifecycle guard and test
/// mock in the source actually relies on.
pub trait SignaturePredicate: Send + Sync {
    /// Returns `true` if `signature` is acceptable for `agent_id`.
    fn verify(&self, signature: &str, agent_id: &str) -> bool;
}

/// Accepts exactly `cryovant-dev-<agent_id>`. Never use in production: this
/// predicate performs no cryptographic verification at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct DevSignaturePredicate;

impl SignaturePredicate for DevSignaturePredicate {
    fn verify(&self, signature: &str, agent_id: &str) -> bool {
        signature == format!("cryovant-dev-{agent_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_dev_signature() {
        let pred = DevSignaturePredicate;
        assert!(pred.verify("cryovant-dev-alpha", "alpha"));
    }

    #[test]
    fn rejects_mismatched_agent() {
        let pred = DevSignaturePredicate;
        assert!(!pred.verify("cryovant-dev-alpha", "beta"));
    }

    #[test]
    fn rejects_non_dev_signature() {
        let pred = DevSignaturePredicate;
        assert!(!pred.verify("some-real-signature", "alpha"));
    }
}
