//! Echo reconciliation: telling "my own write coming back" apart from
//! "someone else's concurrent write".
//!
//! The server relays every update to every client, sender included. Local
//! state already reflects the client's own writes (they were applied
//! optimistically), so reapplying the echo would at best be redundant and at
//! worst overwrite a newer local edit made in the meantime. The reconciler
//! keeps a bounded ring of exactly what was put on the wire, in send order,
//! and matches inbound updates against the oldest unconsumed record.
//!
//! The bound (100 records by default, ≈10 s of round-trip at one flush per
//! 100 ms) is a memory/latency trade-off, not a correctness guarantee: past
//! it, echoes silently stop being recognized and reapply as remote edits.
//! Raising it does not fix that — only a real acknowledgment protocol would.

use std::collections::VecDeque;

use kanva_core::{ElementId, Patch};

/// What to do with an inbound update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoOutcome {
    /// The client's own write echoed back: consume, do not reapply.
    OwnEcho,
    /// A concurrent edit raced an unconfirmed local write. Echo tracking was
    /// abandoned (ring discarded); apply the update normally.
    ConcurrentConflict,
    /// Unrelated remote update: apply normally.
    Remote,
}

/// One sent update, retained until its echo arrives.
#[derive(Debug, Clone, PartialEq)]
struct SentUpdate {
    id: ElementId,
    patch: Patch,
}

/// Bounded history of sent update payloads, in arrival order.
#[derive(Debug)]
pub struct EchoReconciler {
    ring: VecDeque<SentUpdate>,
    capacity: usize,
}

impl EchoReconciler {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Record a copy of what just went on the wire. The oldest record is
    /// dropped when the ring is full.
    pub fn observe_sent(&mut self, id: &str, patch: &Patch) {
        if self.ring.len() >= self.capacity {
            if let Some(evicted) = self.ring.pop_front() {
                log::debug!(
                    "echo ring full, dropping oldest record for {}",
                    evicted.id
                );
            }
        }
        self.ring.push_back(SentUpdate {
            id: id.to_string(),
            patch: patch.clone(),
        });
    }

    /// Classify an inbound update against the oldest unconsumed record.
    pub fn classify(&mut self, id: &str, patch: &Patch) -> EchoOutcome {
        let oldest = match self.ring.front() {
            Some(record) => record,
            None => return EchoOutcome::Remote,
        };

        if oldest.id == id && oldest.patch == *patch {
            self.ring.pop_front();
            log::debug!("suppressed own echo for {id}");
            return EchoOutcome::OwnEcho;
        }

        // Same element, overlapping attribute keys: a concurrent edit raced
        // our unconfirmed write. Abandon echo tracking entirely rather than
        // risk misattributing a future echo.
        if oldest.id == id && oldest.patch.keys().any(|key| patch.contains_key(key)) {
            log::debug!("concurrent edit on {id}, discarding {} echo records", self.ring.len());
            self.ring.clear();
            return EchoOutcome::ConcurrentConflict;
        }

        EchoOutcome::Remote
    }

    /// Forget all records. Used when a snapshot replaces the tree: records
    /// sent on a dead socket can never be echoed.
    pub fn clear(&mut self) {
        self.ring.clear();
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patch(entries: &[(&str, serde_json::Value)]) -> Patch {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_own_echo_consumed() {
        let mut reconciler = EchoReconciler::new(100);
        let sent = patch(&[("x", json!(20))]);
        reconciler.observe_sent("5", &sent);

        assert_eq!(reconciler.classify("5", &sent), EchoOutcome::OwnEcho);
        assert!(reconciler.is_empty());
    }

    #[test]
    fn test_echoes_consumed_in_send_order() {
        let mut reconciler = EchoReconciler::new(100);
        let first = patch(&[("x", json!(1))]);
        let second = patch(&[("y", json!(2))]);
        reconciler.observe_sent("a", &first);
        reconciler.observe_sent("b", &second);

        assert_eq!(reconciler.classify("a", &first), EchoOutcome::OwnEcho);
        assert_eq!(reconciler.classify("b", &second), EchoOutcome::OwnEcho);
        assert!(reconciler.is_empty());
    }

    #[test]
    fn test_concurrent_conflict_discards_ring() {
        let mut reconciler = EchoReconciler::new(100);
        reconciler.observe_sent("5", &patch(&[("x", json!(20))]));
        reconciler.observe_sent("5", &patch(&[("y", json!(1))]));

        // Same element, same attribute, different value: somebody else won.
        let incoming = patch(&[("x", json!(99))]);
        assert_eq!(
            reconciler.classify("5", &incoming),
            EchoOutcome::ConcurrentConflict
        );
        assert!(reconciler.is_empty());
    }

    #[test]
    fn test_unrelated_element_is_remote() {
        let mut reconciler = EchoReconciler::new(100);
        reconciler.observe_sent("5", &patch(&[("x", json!(20))]));

        let incoming = patch(&[("x", json!(7))]);
        assert_eq!(reconciler.classify("other", &incoming), EchoOutcome::Remote);
        // Record stays: its echo is still expected.
        assert_eq!(reconciler.len(), 1);
    }

    #[test]
    fn test_same_element_disjoint_keys_is_remote() {
        let mut reconciler = EchoReconciler::new(100);
        reconciler.observe_sent("5", &patch(&[("x", json!(20))]));

        let incoming = patch(&[("name", json!("Other"))]);
        assert_eq!(reconciler.classify("5", &incoming), EchoOutcome::Remote);
        assert_eq!(reconciler.len(), 1);
    }

    #[test]
    fn test_empty_ring_is_remote() {
        let mut reconciler = EchoReconciler::new(100);
        assert_eq!(
            reconciler.classify("5", &patch(&[("x", json!(1))])),
            EchoOutcome::Remote
        );
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut reconciler = EchoReconciler::new(3);
        for i in 0..4 {
            reconciler.observe_sent(&i.to_string(), &patch(&[("x", json!(i))]));
        }
        assert_eq!(reconciler.len(), 3);

        // Record "0" was evicted: its echo now looks remote.
        assert_eq!(
            reconciler.classify("0", &patch(&[("x", json!(0))])),
            EchoOutcome::Remote
        );
    }

    #[test]
    fn test_clear() {
        let mut reconciler = EchoReconciler::new(100);
        reconciler.observe_sent("a", &patch(&[("x", json!(1))]));
        reconciler.clear();
        assert!(reconciler.is_empty());
    }
}
