//! Impact Scorer (C8): a bounded [0,1] risk score computed from a request's
//! targets, used by the Governor to gate authority levels (§4.8, §4.9).

use governor_spec::{MutationRequest, TargetType};

const STRUCTURAL_PATH_TOKENS: &[&str] =
    &["security", "governance", "constitution", "runtime", "core"];

/// Breakdown of the four weighted components that sum to [`ImpactScore::total`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImpactScore {
    pub semantic_depth: f64,
    pub structural_risk: f64,
    pub governance_proximity: f64,
    pub lineage_divergence: f64,
    pub total: f64,
}

/// Compute the impact score for `request` (§4.8).
pub fn compute_impact(request: &MutationRequest) -> ImpactScore {
    let semantic_depth = (request.total_ops() as f64 / 12.0).min(1.0);

    let structural_risk = request
        .targets
        .iter()
        .map(|t| {
            let path_hit: f64 = if STRUCTURAL_PATH_TOKENS
                .iter()
                .any(|token| t.path.contains(token))
            {
                1.0
            } else {
                0.2
            };
            path_hit.max(t.target_type.structural_weight())
        })
        .fold(0.0_f64, f64::max);

    let governance_proximity = if request
        .targets
        .iter()
        .any(|t| t.path.contains("certificate") || t.path.contains("ledger"))
    {
        1.0
    } else {
        0.25
    };

    let lineage_divergence = (request.distinct_target_types() as f64 / 4.0).min(1.0);

    let total = (0.35 * semantic_depth
        + 0.30 * structural_risk
        + 0.20 * governance_proximity
        + 0.15 * lineage_divergence)
        .clamp(0.0, 1.0);

    ImpactScore {
        semantic_depth,
        structural_risk,
        governance_proximity,
        lineage_divergence,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use governor_spec::{AuthorityLevel, MutationTarget};
    use serde_json::json;

    fn request_with_targets(targets: Vec<MutationTarget>) -> MutationRequest {
        MutationRequest {
            agent_id: "alpha".to_string(),
            generation_ts: "2026-01-01T00:00:00Z".to_string(),
            intent: "test".to_string(),
            ops: vec![],
            signature: "cryovant-dev-alpha".to_string(),
            nonce: "n-1".to_string(),
            targets,
            epoch_id: "epoch-1".to_string(),
            bundle_id: String::new(),
            random_seed: 0,
            capability_scopes: vec![],
            authority_level: AuthorityLevel::HighImpact,
        }
    }

    #[test]
    fn empty_bundle_has_zero_structural_risk_but_default_governance_proximity() {
        let req = request_with_targets(vec![]);
        let score = compute_impact(&req);
        assert_eq!(score.structural_risk, 0.0);
        assert_eq!(score.governance_proximity, 0.25);
    }

    #[test]
    fn security_target_saturates_structural_risk() {
        let target = MutationTarget::new(
            "alpha",
            "security/policy.json",
            TargetType::Security,
            vec![json!({"op": "set"})],
            "",
        )
        .unwrap();
        let req = request_with_targets(vec![target]);
        let score = compute_impact(&req);
        assert_eq!(score.structural_risk, 1.0);
    }

    #[test]
    fn total_is_clamped_to_unit_interval() {
        let many_ops: Vec<_> = (0..50).map(|_| json!({"op": "set"})).collect();
        let target = MutationTarget::new(
            "alpha",
            "runtime/core.json",
            TargetType::Runtime,
            many_ops,
            "",
        )
        .unwrap();
        let req = request_with_targets(vec![target]);
        let score = compute_impact(&req);
        assert!(score.total <= 1.0);
    }

    #[test]
    fn ledger_path_triggers_governance_proximity() {
        let target =
            MutationTarget::new("alpha", "ledger/config.json", TargetType::Config, vec![], "")
                .unwrap();
        let req = request_with_targets(vec![target]);
        let score = compute_impact(&req);
        assert_eq!(score.governance_proximity, 1.0);
    }
}
