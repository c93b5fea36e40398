//! The canonical in-memory element collection.
//!
//! One flat, ordered `Vec` holds every element of the loaded project; the
//! parent field is a lookup key back into the same collection. Sibling order
//! under any parent is the relative order of that parent's children within
//! this single global sequence, so reordering is one remove+reinsert and
//! reparenting never moves anything.
//!
//! All mutation here is synchronous and local. Emitting protocol messages for
//! mutations is the session's job; the store only reports what changed.

use serde_json::Value;

use crate::element::{Element, ElementId, ElementKind, Patch};

/// Ordered, identifier-indexed element collection for one project.
#[derive(Debug, Default)]
pub struct ProjectTree {
    elements: Vec<Element>,
    selected: Option<ElementId>,
}

impl ProjectTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Elements in global order.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.id == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.elements.iter().position(|e| e.id == id)
    }

    /// Number of elements of the given kind, for default display names.
    pub fn count_of(&self, kind: ElementKind) -> usize {
        self.elements.iter().filter(|e| e.kind == kind).count()
    }

    /// Append an element at the end of the global order.
    ///
    /// Idempotent: a duplicate id leaves the collection unchanged, matching
    /// the remote side's create handling.
    pub fn insert(&mut self, element: Element) {
        if self.get(&element.id).is_some() {
            log::debug!("ignoring duplicate create for {}", element.id);
            return;
        }
        self.elements.push(element);
    }

    /// Rewrite the named attributes of `id` in place.
    ///
    /// Returns false (and changes nothing) when the id is unknown.
    pub fn update(&mut self, id: &str, patch: &Patch) -> bool {
        match self.elements.iter_mut().find(|e| e.id == id) {
            Some(element) => {
                element.apply_patch(patch);
                true
            }
            None => false,
        }
    }

    /// Remove `id` and every transitive descendant.
    ///
    /// Returns the removed ids (root first). Removing an absent id is a
    /// no-op returning an empty list. Clears the selection if it pointed at
    /// a removed element.
    pub fn remove_cascade(&mut self, id: &str) -> Vec<ElementId> {
        if self.get(id).is_none() {
            return Vec::new();
        }
        let mut removed = vec![id.to_string()];
        let mut cursor = 0;
        while cursor < removed.len() {
            let parent = removed[cursor].clone();
            for element in &self.elements {
                if element.parent.as_deref() == Some(parent.as_str()) {
                    removed.push(element.id.clone());
                }
            }
            cursor += 1;
        }
        self.elements.retain(|e| !removed.contains(&e.id));
        if let Some(selected) = &self.selected {
            if removed.contains(selected) {
                self.selected = None;
            }
        }
        removed
    }

    /// Absolute (root-relative) position: the sum of offsets along the
    /// ancestor chain. The walk is bounded by the element count, so a
    /// corrupted parent chain cannot loop forever.
    pub fn absolute_position(&self, id: &str) -> Option<(f64, f64)> {
        let mut element = self.get(id)?;
        let mut x = element.x;
        let mut y = element.y;
        let mut hops = 0;
        while let Some(parent_id) = &element.parent {
            hops += 1;
            if hops > self.elements.len() {
                log::warn!("parent chain of {id} does not terminate");
                return None;
            }
            match self.get(parent_id) {
                Some(parent) => {
                    x += parent.x;
                    y += parent.y;
                    element = parent;
                }
                None => break,
            }
        }
        Some((x, y))
    }

    /// Whether `id` appears in the ancestor chain of `descendant`.
    ///
    /// Cost is proportional to tree depth.
    pub fn is_ancestor(&self, id: &str, descendant: &str) -> bool {
        let mut current = match self.get(descendant) {
            Some(e) => e,
            None => return false,
        };
        let mut hops = 0;
        while let Some(parent_id) = &current.parent {
            if parent_id == id {
                return true;
            }
            hops += 1;
            if hops > self.elements.len() {
                return false;
            }
            match self.get(parent_id) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
        false
    }

    /// Reparent `id` under `new_parent` (or detach to root), preserving the
    /// element's absolute position.
    ///
    /// Silently rejects (returns `None`, no mutation) when the move is
    /// structurally invalid: self-parenting, missing target, a Text target,
    /// or a cycle (`new_parent` is a descendant of `id`). On acceptance the
    /// parent and both offsets change together in the single returned patch
    /// so the element never visually moves.
    pub fn make_child(&mut self, id: &str, new_parent: Option<&str>) -> Option<Patch> {
        if !self.can_reparent(id, new_parent) {
            return None;
        }
        let (abs_x, abs_y) = self.absolute_position(id)?;
        let (parent_x, parent_y) = match new_parent {
            Some(parent_id) => self.absolute_position(parent_id)?,
            None => (0.0, 0.0),
        };

        let mut patch = Patch::new();
        patch.insert(
            "parent".into(),
            new_parent.map(Value::from).unwrap_or(Value::Null),
        );
        patch.insert("x".into(), Value::from(abs_x - parent_x));
        patch.insert("y".into(), Value::from(abs_y - parent_y));
        self.update(id, &patch);
        Some(patch)
    }

    /// Move `id` immediately after `after` in the global order, or to the
    /// front when `after` is absent.
    ///
    /// Changes only relative order — never parentage, never attributes — and
    /// is a no-op when either id is unknown. Replaying the same target
    /// position is idempotent, so a local reorder and its echo converge.
    pub fn put_after(&mut self, id: &str, after: Option<&str>) -> bool {
        let from = match self.position(id) {
            Some(index) => index,
            None => return false,
        };
        let element = self.elements.remove(from);
        let to = match after {
            Some(after_id) => match self.position(after_id) {
                Some(index) => index + 1,
                None => {
                    // Unknown anchor: restore the original order.
                    self.elements.insert(from, element);
                    return false;
                }
            },
            None => 0,
        };
        self.elements.insert(to, element);
        true
    }

    /// Replace the whole collection with a snapshot.
    pub fn replace_all(&mut self, elements: Vec<Element>) {
        self.elements = elements;
        if let Some(selected) = &self.selected {
            if self.get(selected).is_none() {
                self.selected = None;
            }
        }
    }

    /// Drop all elements and the selection (project unload).
    pub fn clear(&mut self) {
        self.elements.clear();
        self.selected = None;
    }

    // Selection: id-based, so inbound updates reach the selected element
    // without a separate copy to merge into.

    pub fn select(&mut self, id: Option<ElementId>) {
        self.selected = match id {
            Some(id) if self.get(&id).is_some() => Some(id),
            _ => None,
        };
    }

    pub fn selected(&self) -> Option<&ElementId> {
        self.selected.as_ref()
    }

    pub fn selected_element(&self) -> Option<&Element> {
        self.selected.as_deref().and_then(|id| self.get(id))
    }
}
