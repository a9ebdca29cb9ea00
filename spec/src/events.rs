//! Typed payload shapes for the two ledger events that are built and read
//! back as structured data rather than assembled ad hoc at the call site
//! (§4.12, §4.15). Every other ledger/journal line is a bare
//! `{type, payload}` pair keyed by a `&str` event-type tag — adding a typed
//! variant for those would duplicate the on-disk shape without a consumer.

use serde::{Deserialize, Serialize};

/// Checkpoint emitted for an epoch (§4.12).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpochCheckpointEvent {
    pub checkpoint_id: String,
    pub epoch_id: String,
    pub sequence: u64,
    pub prev_checkpoint_hash: String,
    pub checkpoint_hash: String,
    pub policy_hash: String,
    pub ts: String,
}

/// A mutation was promoted from sandbox to live (§4.15).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromotionEvent {
    pub event_id: String,
    pub mutation_id: String,
    pub epoch_id: String,
    pub prev_event_hash: String,
    pub event_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_event_round_trips() {
        let ev = EpochCheckpointEvent {
            checkpoint_id: "chk-1".to_string(),
            epoch_id: "epoch-20260101T000000Z-abcdef".to_string(),
            sequence: 1,
            prev_checkpoint_hash: "sha256:0".to_string(),
            checkpoint_hash: "sha256:abc".to_string(),
            policy_hash: "sha256:def".to_string(),
            ts: "2026-01-01T00:00:00Z".to_string(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: EpochCheckpointEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(ev, back);
    }
}
