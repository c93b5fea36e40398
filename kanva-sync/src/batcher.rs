//! Outgoing update coalescing.
//!
//! Attribute edits arrive at keystroke/drag granularity; sending each one
//! would flood the wire. The batcher keeps one pending entry per element,
//! created on the first change inside a flush window and merged
//! last-write-wins per attribute on every later change in the same window.
//! The session drains it on a fixed tick (100 ms by default) and only while
//! a connection is open, so edits made offline survive until reconnect.
//!
//! Create, delete and reorder commands never pass through here — they are
//! sent immediately by the session.

use std::collections::BTreeMap;

use kanva_core::{ElementId, Patch};

/// Pending attribute updates, keyed by element id.
#[derive(Debug, Default)]
pub struct UpdateBatcher {
    pending: BTreeMap<ElementId, Patch>,
}

impl UpdateBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `patch` into the pending entry for `id`, creating it on first
    /// change. Later values win per attribute.
    pub fn schedule(&mut self, id: &str, patch: Patch) {
        if patch.is_empty() {
            return;
        }
        let entry = self.pending.entry(id.to_string()).or_default();
        for (key, value) in patch {
            entry.insert(key, value);
        }
    }

    /// Take every pending entry, leaving the batcher empty.
    pub fn drain(&mut self) -> Vec<(ElementId, Patch)> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    /// Put a drained entry back after a failed send.
    ///
    /// The inverse of [`Self::schedule`]'s merge direction: attributes
    /// scheduled since the drain are newer than the returning copy and keep
    /// their values.
    pub fn requeue(&mut self, id: &str, patch: Patch) {
        if patch.is_empty() {
            return;
        }
        let entry = self.pending.entry(id.to_string()).or_default();
        for (key, value) in patch {
            entry.entry(key).or_insert(value);
        }
    }

    /// Discard pending entries for elements that no longer exist locally,
    /// so a delete is never followed by an update for the same id.
    pub fn forget(&mut self, ids: &[ElementId]) {
        for id in ids {
            self.pending.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
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
    fn test_coalesces_same_attribute() {
        let mut batcher = UpdateBatcher::new();
        batcher.schedule("5", patch(&[("x", json!(10))]));
        batcher.schedule("5", patch(&[("x", json!(20))]));

        let drained = batcher.drain();
        assert_eq!(drained.len(), 1);
        let (id, merged) = &drained[0];
        assert_eq!(id, "5");
        assert_eq!(merged["x"], json!(20));
    }

    #[test]
    fn test_merges_distinct_attributes() {
        let mut batcher = UpdateBatcher::new();
        batcher.schedule("a", patch(&[("x", json!(1))]));
        batcher.schedule("a", patch(&[("y", json!(2))]));

        let drained = batcher.drain();
        assert_eq!(drained[0].1.len(), 2);
    }

    #[test]
    fn test_separate_elements_stay_separate() {
        let mut batcher = UpdateBatcher::new();
        batcher.schedule("a", patch(&[("x", json!(1))]));
        batcher.schedule("b", patch(&[("x", json!(2))]));
        assert_eq!(batcher.len(), 2);
    }

    #[test]
    fn test_drain_empties() {
        let mut batcher = UpdateBatcher::new();
        batcher.schedule("a", patch(&[("x", json!(1))]));
        assert!(!batcher.is_empty());
        let _ = batcher.drain();
        assert!(batcher.is_empty());
        assert!(batcher.drain().is_empty());
    }

    #[test]
    fn test_empty_patch_ignored() {
        let mut batcher = UpdateBatcher::new();
        batcher.schedule("a", Patch::new());
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_requeue_restores_drained_entry() {
        let mut batcher = UpdateBatcher::new();
        batcher.schedule("5", patch(&[("x", json!(1))]));
        let drained = batcher.drain();
        assert!(batcher.is_empty());

        for (id, p) in drained {
            batcher.requeue(&id, p);
        }
        let restored = batcher.drain();
        assert_eq!(restored[0].1["x"], json!(1));
    }

    #[test]
    fn test_requeue_does_not_clobber_newer_edits() {
        let mut batcher = UpdateBatcher::new();
        batcher.schedule("5", patch(&[("x", json!(1)), ("y", json!(3))]));
        let drained = batcher.drain();

        // An edit landed while the drained copy was in flight.
        batcher.schedule("5", patch(&[("x", json!(2))]));
        for (id, p) in drained {
            batcher.requeue(&id, p);
        }

        let merged = &batcher.drain()[0].1;
        assert_eq!(merged["x"], json!(2));
        assert_eq!(merged["y"], json!(3));
    }

    #[test]
    fn test_forget_drops_pending() {
        let mut batcher = UpdateBatcher::new();
        batcher.schedule("a", patch(&[("x", json!(1))]));
        batcher.schedule("b", patch(&[("x", json!(2))]));
        batcher.forget(&["a".to_string()]);
        let drained = batcher.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].0, "b");
    }
}
