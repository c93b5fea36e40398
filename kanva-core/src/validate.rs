//! Drag-and-drop validation predicates.
//!
//! A UI checks these before invoking [`ProjectTree::make_child`] or
//! [`ProjectTree::put_after`], so it never attempts a move the store would
//! reject. They are pure reads over current tree state and enforce exactly
//! the same rules as the store itself: no self-parenting, no Text parents,
//! no cycles.

use crate::element::ElementKind;
use crate::tree::ProjectTree;

impl ProjectTree {
    /// Whether `id` may be reparented under `new_parent` (None = root).
    pub fn can_reparent(&self, id: &str, new_parent: Option<&str>) -> bool {
        if self.get(id).is_none() {
            return false;
        }
        let parent_id = match new_parent {
            Some(parent_id) => parent_id,
            // Detaching to root is always structurally valid.
            None => return true,
        };
        if parent_id == id {
            return false;
        }
        let parent = match self.get(parent_id) {
            Some(parent) => parent,
            None => return false,
        };
        if !parent.kind.allows_children() {
            return false;
        }
        !self.is_ancestor(id, parent_id)
    }

    /// Whether dropping `dragged` onto `target` (making it a child) is valid.
    pub fn can_drop_on(&self, dragged: &str, target: Option<&str>) -> bool {
        self.can_reparent(dragged, target)
    }

    /// Whether dropping `dragged` next to `target` (a reorder) is valid.
    ///
    /// Reordering never changes parentage, so Text targets are fine; only
    /// self-drops and drops inside the dragged subtree are rejected.
    pub fn can_drop_beside(&self, dragged: &str, target: Option<&str>) -> bool {
        if self.get(dragged).is_none() {
            return false;
        }
        let target_id = match target {
            Some(target_id) => target_id,
            None => return true,
        };
        if target_id == dragged {
            return false;
        }
        if self.get(target_id).is_none() {
            return false;
        }
        !self.is_ancestor(dragged, target_id)
    }

    /// Variant rule behind [`Self::can_reparent`], exposed for UI affordances
    /// (e.g. greying out invalid drop targets without a dragged element).
    pub fn can_have_children(&self, id: &str) -> bool {
        self.get(id)
            .map(|e| e.kind == ElementKind::Block)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use crate::element::Element;
    use crate::tree::ProjectTree;

    fn tree_with_chain() -> ProjectTree {
        // root ── mid ── leaf, plus a text element and a free block
        let mut tree = ProjectTree::new();
        tree.insert(Element::block("root".into(), "Block 1"));
        let mut mid = Element::block("mid".into(), "Block 2");
        mid.parent = Some("root".into());
        tree.insert(mid);
        let mut leaf = Element::block("leaf".into(), "Block 3");
        leaf.parent = Some("mid".into());
        tree.insert(leaf);
        let mut label = Element::text("label".into(), "Text 1");
        label.parent = Some("root".into());
        tree.insert(label);
        tree.insert(Element::block("free".into(), "Block 4"));
        tree
    }

    #[test]
    fn test_can_reparent_valid_moves() {
        let tree = tree_with_chain();
        assert!(tree.can_reparent("free", Some("leaf")));
        assert!(tree.can_reparent("leaf", Some("root")));
        assert!(tree.can_reparent("leaf", None));
    }

    #[test]
    fn test_can_reparent_rejections() {
        let tree = tree_with_chain();
        assert!(!tree.can_reparent("root", Some("root"))); // self
        assert!(!tree.can_reparent("free", Some("ghost"))); // missing target
        assert!(!tree.can_reparent("free", Some("label"))); // text parent
        assert!(!tree.can_reparent("root", Some("leaf"))); // cycle
        assert!(!tree.can_reparent("ghost", Some("root"))); // missing element
    }

    #[test]
    fn test_can_drop_beside() {
        let tree = tree_with_chain();
        assert!(tree.can_drop_beside("free", Some("label"))); // text ok for reorder
        assert!(tree.can_drop_beside("free", None));
        assert!(!tree.can_drop_beside("free", Some("free")));
        assert!(!tree.can_drop_beside("root", Some("leaf"))); // inside own subtree
        assert!(!tree.can_drop_beside("free", Some("ghost")));
    }

    #[test]
    fn test_can_have_children() {
        let tree = tree_with_chain();
        assert!(tree.can_have_children("root"));
        assert!(!tree.can_have_children("label"));
        assert!(!tree.can_have_children("ghost"));
    }
}
