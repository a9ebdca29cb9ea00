//! Federation Coordinator (C16): deterministic quorum/consensus/conflict
//! resolution over peer policy-version votes (§4.16).

use governor_spec::sha256_prefixed_digest;
use serde::{Deserialize, Serialize};

/// One peer's vote in a federation round (§4.16).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vote {
    pub peer_id: String,
    pub policy_version: String,
    pub decision: String,
    pub manifest_digest: String,
}

/// The full exchange envelope a federation round evaluates over.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Exchange {
    pub round_id: String,
    pub local_policy_version: String,
    pub votes: Vec<Vote>,
}

/// Classified outcome of [`evaluate_federation_decision`] (§4.16).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionClass {
    Consensus,
    Quorum,
    Conflict,
    Rejected,
}

/// Result of a federation round (§4.16).
#[derive(Debug, Clone, PartialEq)]
pub struct FederationDecision {
    pub decision_class: DecisionClass,
    pub selected_policy_version: String,
    pub reconciliation_actions: Vec<String>,
    pub vote_digest: String,
    pub exchange_digest: String,
}

/// Tally `exchange.votes` (plus the local peer's implicit accept vote) by
/// policy_version and classify the outcome (§4.16).
pub fn evaluate_federation_decision(exchange: &Exchange, quorum_size: usize) -> FederationDecision {
    let mut rows: Vec<Vote> = exchange.votes.clone();
    rows.push(Vote {
        peer_id: "local".to_string(),
        policy_version: exchange.local_policy_version.clone(),
        decision: "accept".to_string(),
        manifest_digest: String::new(),
    });

    let mut tallies: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
    for vote in &rows {
        if vote.decision == "accept" {
            *tallies.entry(vote.policy_version.clone()).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(String, usize)> = tallies.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let (decision_class, selected_policy_version, reconciliation_actions) = match ranked.as_slice() {
        [] => (DecisionClass::Rejected, exchange.local_policy_version.clone(), vec![]),
        [(version, count)] if *count >= quorum_size => (
            DecisionClass::Consensus,
            version.clone(),
            vec!["bind_policy_version".to_string()],
        ),
        [(version, count), ..] if *count >= quorum_size => (
            DecisionClass::Quorum,
            version.clone(),
            vec![
                "stage_majority_policy".to_string(),
                "request_minor_peer_reconciliation".to_string(),
            ],
        ),
        [(_, count), rest @ ..] if !rest.is_empty() || *count < quorum_size => {
            if ranked.len() > 1 {
                (DecisionClass::Conflict, exchange.local_policy_version.clone(), vec![])
            } else {
                (DecisionClass::Rejected, exchange.local_policy_version.clone(), vec![])
            }
        }
        _ => (DecisionClass::Rejected, exchange.local_policy_version.clone(), vec![]),
    };

    let mut sorted_rows = rows.clone();
    sorted_rows.sort_by(|a, b| {
        (a.peer_id.clone(), a.policy_version.clone())
            .cmp(&(b.peer_id.clone(), b.policy_version.clone()))
    });
    let vote_digest = sha256_prefixed_digest(&sorted_rows);
    let exchange_digest = sha256_prefixed_digest(exchange);

    FederationDecision {
        decision_class,
        selected_policy_version,
        reconciliation_actions,
        vote_digest,
        exchange_digest,
    }
}

/// Governance precedence given independently-computed local and federated
/// pass/fail verdicts (§4.16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precedence {
    Local,
    Federated,
    Both,
}

/// Joined verdict classification (§4.16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinedDecision {
    LocalOverride,
    Conflict,
    Consensus,
    Rejected,
}

/// Resolve governance precedence between a local and a federated pass/fail
/// verdict (§4.16).
pub fn resolve_governance_precedence(
    local_passed: bool,
    federated_passed: bool,
    precedence: Precedence,
) -> JoinedDecision {
    match precedence {
        Precedence::Local => {
            if local_passed {
                JoinedDecision::LocalOverride
            } else {
                JoinedDecision::Rejected
            }
        }
        Precedence::Federated => {
            if federated_passed {
                JoinedDecision::Consensus
            } else {
                JoinedDecision::Rejected
            }
        }
        Precedence::Both => match (local_passed, federated_passed) {
            (true, true) => JoinedDecision::Consensus,
            (false, false) => JoinedDecision::Rejected,
            _ => JoinedDecision::Conflict,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(local: &str, votes: Vec<(&str, &str)>) -> Exchange {
        Exchange {
            round_id: "round-1".to_string(),
            local_policy_version: local.to_string(),
            votes: votes
                .into_iter()
                .map(|(peer, version)| Vote {
                    peer_id: peer.to_string(),
                    policy_version: version.to_string(),
                    decision: "accept".to_string(),
                    manifest_digest: format!("sha256:{peer}"),
                })
                .collect(),
        }
    }

    #[test]
    fn quorum_when_peers_agree_on_new_version() {
        let ex = exchange("2.0", vec![("peer-a", "2.1"), ("peer-b", "2.1")]);
        let decision = evaluate_federation_decision(&ex, 2);
        assert_eq!(decision.decision_class, DecisionClass::Quorum);
        assert_eq!(decision.selected_policy_version, "2.1");
        assert_eq!(
            decision.reconciliation_actions,
            vec!["stage_majority_policy", "request_minor_peer_reconciliation"]
        );
    }

    #[test]
    fn consensus_when_single_version_meets_quorum() {
        let ex = exchange("2.0", vec![("peer-a", "2.0"), ("peer-b", "2.0")]);
        let decision = evaluate_federation_decision(&ex, 3);
        assert_eq!(decision.decision_class, DecisionClass::Consensus);
        assert_eq!(decision.selected_policy_version, "2.0");
    }

    #[test]
    fn vote_digest_is_permutation_invariant() {
        let ex_a = exchange("2.0", vec![("peer-a", "2.1"), ("peer-b", "2.1")]);
        let ex_b = exchange("2.0", vec![("peer-b", "2.1"), ("peer-a", "2.1")]);
        let decision_a = evaluate_federation_decision(&ex_a, 2);
        let decision_b = evaluate_federation_decision(&ex_b, 2);
        assert_eq!(decision_a.vote_digest, decision_b.vote_digest);
        assert_eq!(decision_a.decision_class, decision_b.decision_class);
        assert_eq!(decision_a.selected_policy_version, decision_b.selected_policy_version);
    }

    #[test]
    fn both_precedence_conflict_when_verdicts_disagree() {
        let joined = resolve_governance_precedence(true, false, Precedence::Both);
        assert_eq!(joined, JoinedDecision::Conflict);
    }
}
