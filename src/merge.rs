//! The merge engine: a pure fold of deltas into materialized state.
//!
//! `apply` is total and deterministic — two replicas that fold the same
//! delta sequence in the same order always hold equal state. The log is
//! authoritative; the materialized mapping is a cache that must be exactly
//! reproducible by replaying from empty.

use serde_json::Value;
use std::collections::HashMap;

use crate::protocol::{Delta, DeltaPayload};

/// Materialized state: entity name → record id → current record value.
pub type EntityMap = HashMap<String, HashMap<String, Value>>;

/// Name of the sub-object on a parent record that holds counter values.
const COUNTERS_FIELD: &str = "counters";

/// Apply one delta to the state mapping. Returns whether state changed.
///
/// Never fails: unrecognized payloads and counters whose parent record does
/// not exist are absorbed as no-ops so unknown deltas can still ride the
/// log for forward compatibility.
pub fn apply(state: &mut EntityMap, delta: &Delta) -> bool {
    match delta.payload() {
        DeltaPayload::LwwUpsert { entity, id, record } => {
            // Most recently applied wins — wholesale replacement, no clock
            state
                .entry(entity.to_string())
                .or_default()
                .insert(id.to_string(), record.clone());
            true
        }
        DeltaPayload::CounterIncrement {
            entity,
            parent_id,
            key,
        } => increment_counter(state, entity, parent_id, key),
        DeltaPayload::Unknown => {
            log::debug!(
                "Ignoring unrecognized delta (entity={}, strategy={:?})",
                delta.entity,
                delta.strategy
            );
            false
        }
    }
}

/// Apply a batch of deltas in order. Returns how many changed state.
pub fn apply_all(state: &mut EntityMap, deltas: &[Delta]) -> usize {
    deltas.iter().filter(|d| apply(state, d)).count()
}

fn increment_counter(state: &mut EntityMap, entity: &str, parent_id: &str, key: &str) -> bool {
    // The parent must already exist; otherwise the increment is dropped
    let parent = match state.get_mut(entity).and_then(|m| m.get_mut(parent_id)) {
        Some(Value::Object(obj)) => obj,
        _ => {
            log::debug!("Counter increment for missing parent {entity}/{parent_id}");
            return false;
        }
    };

    let counters = parent
        .entry(COUNTERS_FIELD.to_string())
        .or_insert_with(|| Value::Object(Default::default()));
    let Value::Object(counters) = counters else {
        log::warn!("Parent {entity}/{parent_id} has a non-object {COUNTERS_FIELD} field");
        return false;
    };

    let count = counters.get(key).and_then(Value::as_u64).unwrap_or(0);
    counters.insert(key.to_string(), Value::from(count + 1));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Strategy;
    use serde_json::json;

    fn seeded(entity: &str, id: &str, record: Value) -> EntityMap {
        let mut state = EntityMap::new();
        state
            .entry(entity.to_string())
            .or_default()
            .insert(id.to_string(), record);
        state
    }

    #[test]
    fn test_lww_insert() {
        let mut state = EntityMap::new();
        let delta = Delta::lww("expense", json!({ "id": "e1", "amount": 10 }));
        assert!(apply(&mut state, &delta));
        assert_eq!(state["expense"]["e1"]["amount"], 10);
    }

    #[test]
    fn test_lww_last_applied_wins() {
        let mut state = EntityMap::new();
        let d1 = Delta::lww("expense", json!({ "id": "7", "amount": 10, "note": "a" }));
        let d2 = Delta::lww("expense", json!({ "id": "7", "amount": 25 }));

        apply(&mut state, &d1);
        apply(&mut state, &d2);
        // Wholesale replacement: the old "note" field is gone
        assert_eq!(state["expense"]["7"], json!({ "id": "7", "amount": 25 }));

        // Reversed order yields the first record
        let mut state = EntityMap::new();
        apply(&mut state, &d2);
        apply(&mut state, &d1);
        assert_eq!(
            state["expense"]["7"],
            json!({ "id": "7", "amount": 10, "note": "a" })
        );
    }

    #[test]
    fn test_lww_disjoint_ids_commute() {
        let d1 = Delta::lww("expense", json!({ "id": "a", "amount": 1 }));
        let d2 = Delta::lww("expense", json!({ "id": "b", "amount": 2 }));

        let mut forward = EntityMap::new();
        apply(&mut forward, &d1);
        apply(&mut forward, &d2);

        let mut reversed = EntityMap::new();
        apply(&mut reversed, &d2);
        apply(&mut reversed, &d1);

        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_counter_accumulation_any_order() {
        let deltas = [
            Delta::counter("message", "m1", "like"),
            Delta::counter("message", "m1", "like"),
            Delta::counter("message", "m1", "like"),
        ];

        // Counters commute: any application order yields 3
        for order in [[0, 1, 2], [2, 0, 1], [1, 2, 0]] {
            let mut state = seeded("message", "m1", json!({ "id": "m1", "text": "hi" }));
            for i in order {
                assert!(apply(&mut state, &deltas[i]));
            }
            assert_eq!(state["message"]["m1"]["counters"]["like"], 3);
        }
    }

    #[test]
    fn test_counter_missing_parent_is_noop() {
        let mut state = EntityMap::new();
        let delta = Delta::counter("message", "ghost", "like");
        assert!(!apply(&mut state, &delta));
        assert!(state.is_empty());
    }

    #[test]
    fn test_counter_distinct_keys() {
        let mut state = seeded("message", "m1", json!({ "id": "m1" }));
        apply(&mut state, &Delta::counter("message", "m1", "like"));
        apply(&mut state, &Delta::counter("message", "m1", "heart"));
        apply(&mut state, &Delta::counter("message", "m1", "like"));
        assert_eq!(state["message"]["m1"]["counters"]["like"], 2);
        assert_eq!(state["message"]["m1"]["counters"]["heart"], 1);
    }

    #[test]
    fn test_counter_preserved_across_lww_of_other_record() {
        let mut state = seeded("message", "m1", json!({ "id": "m1" }));
        apply(&mut state, &Delta::counter("message", "m1", "like"));
        apply(&mut state, &Delta::lww("message", json!({ "id": "m2" })));
        assert_eq!(state["message"]["m1"]["counters"]["like"], 1);
    }

    #[test]
    fn test_unknown_strategy_is_noop() {
        let mut state = EntityMap::new();
        let delta: Delta =
            serde_json::from_str(r#"{"strategy":"orset","entity":"x","record":{"id":"1"}}"#)
                .unwrap();
        assert!(!apply(&mut state, &delta));
        assert!(state.is_empty());
    }

    #[test]
    fn test_malformed_record_is_noop() {
        let mut state = EntityMap::new();
        // LWW without an id field
        let delta = Delta::new(Strategy::Lww, "expense", json!({ "amount": 10 }));
        assert!(!apply(&mut state, &delta));
        // LWW with a non-string id
        let delta = Delta::new(Strategy::Lww, "expense", json!({ "id": 42 }));
        assert!(!apply(&mut state, &delta));
        assert!(state.is_empty());
    }

    #[test]
    fn test_replay_reproduces_state() {
        let log = vec![
            Delta::lww("expense", json!({ "id": "e1", "amount": 10 })),
            Delta::lww("category", json!({ "id": "c1", "name": "Food" })),
            Delta::lww("expense", json!({ "id": "e1", "amount": 25 })),
            Delta::lww("message", json!({ "id": "m1", "text": "hi" })),
            Delta::counter("message", "m1", "like"),
        ];

        let mut folded = EntityMap::new();
        apply_all(&mut folded, &log);

        // Refold from empty: identical state
        let mut refolded = EntityMap::new();
        for delta in &log {
            apply(&mut refolded, delta);
        }
        assert_eq!(folded, refolded);
        assert_eq!(folded["expense"]["e1"]["amount"], 25);
        assert_eq!(folded["message"]["m1"]["counters"]["like"], 1);
    }

    #[test]
    fn test_batched_delivery_converges() {
        let log: Vec<Delta> = (0..10)
            .map(|i| Delta::lww("expense", json!({ "id": format!("e{}", i % 3), "amount": i })))
            .collect();

        // One replica receives the log in a single batch, the other in
        // uneven chunks — same canonical order, equal final state.
        let mut all_at_once = EntityMap::new();
        apply_all(&mut all_at_once, &log);

        let mut chunked = EntityMap::new();
        apply_all(&mut chunked, &log[..4]);
        apply_all(&mut chunked, &log[4..5]);
        apply_all(&mut chunked, &log[5..]);

        assert_eq!(all_at_once, chunked);
    }

    #[test]
    fn test_apply_all_counts_effective_deltas() {
        let mut state = EntityMap::new();
        let deltas = vec![
            Delta::lww("expense", json!({ "id": "e1" })),
            Delta::counter("message", "ghost", "like"),
        ];
        assert_eq!(apply_all(&mut state, &deltas), 1);
    }
}
