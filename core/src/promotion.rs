//! Promotion Events (C15): hash-chained, timestamp-independent promotion
//! state transitions (§4.15).

use governor_spec::events::PromotionEvent;
use governor_spec::{sha256_prefixed_digest, ZERO_HASH};

/// Derive a deterministic `evt_<16-hex>` event id from the transition
/// material — timestamp-independent (§4.15).
pub fn derive_event_id(mutation_id: &str, from_state: &str, to_state: &str, prev_event_hash: &str) -> String {
    let material = serde_json::json!({
        "mutation_id": mutation_id,
        "from_state": from_state,
        "to_state": to_state,
        "prev_event_hash": prev_event_hash,
    });
    let digest = sha256_prefixed_digest(&material);
    format!("evt_{}", &digest[7..23])
}

/// Build a chained promotion event. `timestamp` is accepted for the ledger
/// line the caller will append alongside this event but never enters
/// `event_hash`, so replays with different clocks still chain identically
/// (§4.15).
pub fn create_promotion_event(
    mutation_id: &str,
    epoch_id: &str,
    _timestamp: &str,
    from_state: &str,
    to_state: &str,
    prev_event_hash: Option<&str>,
) -> PromotionEvent {
    let prev = prev_event_hash.unwrap_or(ZERO_HASH).to_string();
    let event_id = derive_event_id(mutation_id, from_state, to_state, &prev);
    let hashed_material = serde_json::json!({
        "event_id": event_id,
        "mutation_id": mutation_id,
        "epoch_id": epoch_id,
        "from_state": from_state,
        "to_state": to_state,
        "prev_event_hash": prev,
    });
    let event_hash = sha256_prefixed_digest(&hashed_material);
    PromotionEvent {
        event_id,
        mutation_id: mutation_id.to_string(),
        epoch_id: epoch_id.to_string(),
        prev_event_hash: prev,
        event_hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_is_timestamp_independent() {
        let id_a = derive_event_id("mut-1", "staged", "certified", ZERO_HASH);
        let id_b = derive_event_id("mut-1", "staged", "certified", ZERO_HASH);
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn first_event_chains_from_zero_hash() {
        let event = create_promotion_event("mut-1", "epoch-1", "2026-01-01T00:00:00Z", "staged", "certified", None);
        assert_eq!(event.prev_event_hash, ZERO_HASH);
    }

    #[test]
    fn chained_events_differ_by_prev_hash() {
        let first = create_promotion_event("mut-1", "epoch-1", "2026-01-01T00:00:00Z", "staged", "certified", None);
        let second = create_promotion_event(
            "mut-1",
            "epoch-1",
            "2026-01-01T00:05:00Z",
            "certified",
            "executing",
            Some(&first.event_hash),
        );
        assert_eq!(second.prev_event_hash, first.event_hash);
        assert_ne!(second.event_hash, first.event_hash);
    }

    #[test]
    fn event_hash_ignores_timestamp() {
        let a = create_promotion_event("mut-1", "epoch-1", "2026-01-01T00:00:00Z", "staged", "certified", None);
        let b = create_promotion_event("mut-1", "epoch-1", "2030-06-15T12:00:00Z", "staged", "certified", None);
        assert_eq!(a.event_hash, b.event_hash);
    }
}
