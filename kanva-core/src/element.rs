//! Canvas element model: the tagged Block/Text variant, its wire-shaped JSON
//! form, and attribute patches.
//!
//! Elements live in a flat collection with parent back-references — the tree
//! is never nested objects. Variant-specific visuals (width, background,
//! fontSize, ...) are opaque to the engine: it stores them as JSON values and
//! only conveys attribute diffs. What is *not* opaque is the set of attribute
//! names each variant may carry: every patch crossing a trust boundary is
//! validated against a closed allow-list so wire input cannot inject
//! arbitrary fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque element identifier. Client-generated, globally unique.
///
/// An id may refer to an element that has since been deleted; lookups against
/// the tree return `None` in that case and callers are expected to ignore the
/// stale id.
pub type ElementId = String;

/// Generate a fresh identifier for a new element.
pub fn generate_element_id() -> ElementId {
    Uuid::new_v4().to_string()
}

/// Element variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    /// A styled rectangle that may contain children.
    Block,
    /// A run of single-style text. Never a parent.
    Text,
}

impl ElementKind {
    /// Display label used for default element names ("Block 3", "Text 1").
    pub fn label(&self) -> &'static str {
        match self {
            ElementKind::Block => "Block",
            ElementKind::Text => "Text",
        }
    }

    /// Whether elements of this kind may have children.
    pub fn allows_children(&self) -> bool {
        matches!(self, ElementKind::Block)
    }
}

impl std::str::FromStr for ElementKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(ElementKind::Block),
            "text" => Ok(ElementKind::Text),
            _ => Err(()),
        }
    }
}

/// A set of not-yet-applied attribute changes for one element.
///
/// Keys are wire attribute names. `Value::Null` means "clear this attribute"
/// rather than "store a null". Merging two patches is last-write-wins per
/// attribute.
pub type Patch = BTreeMap<String, Value>;

/// Attributes every element carries, updatable regardless of variant.
const COMMON_ATTRS: &[&str] = &["name", "x", "y", "parent"];

/// Variant payload attributes for blocks.
const BLOCK_ATTRS: &[&str] = &[
    "width",
    "height",
    "background",
    "borderRadius",
    "borders",
    "shadow",
];

/// Variant payload attributes for text.
const TEXT_ATTRS: &[&str] = &[
    "content",
    "alignment",
    "color",
    "fontSize",
    "fontFamily",
    "fontWeight",
    "italic",
    "underline",
    "strikethrough",
];

/// Whether `key` is a legal updatable attribute for the given variant.
pub fn allowed_attr(kind: ElementKind, key: &str) -> bool {
    if COMMON_ATTRS.contains(&key) {
        return true;
    }
    match kind {
        ElementKind::Block => BLOCK_ATTRS.contains(&key),
        ElementKind::Text => TEXT_ATTRS.contains(&key),
    }
}

/// A node in the shared design tree.
///
/// Serializes to the flat JSON object the wire and snapshots use:
/// `{"id": ..., "type": "block", "name": ..., "x": 0, "y": 0,
///   "parent": ..., <variant attrs>...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    #[serde(rename = "type")]
    pub kind: ElementKind,
    // The authoritative side strips default-valued fields from stored
    // elements, so snapshots may omit any of these.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    /// Lookup key into the same collection; `None` means the element sits at
    /// the root. Never an ownership pointer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ElementId>,
    /// Variant-specific payload, opaque to the engine.
    #[serde(flatten)]
    pub attrs: BTreeMap<String, Value>,
}

impl Element {
    /// A block with default visuals at the origin.
    pub fn block(id: ElementId, name: impl Into<String>) -> Self {
        let mut attrs = BTreeMap::new();
        attrs.insert("width".into(), Value::from(100));
        attrs.insert("height".into(), Value::from(100));
        attrs.insert("background".into(), Value::from("#ffffff"));
        Self {
            id,
            kind: ElementKind::Block,
            name: name.into(),
            x: 0.0,
            y: 0.0,
            parent: None,
            attrs,
        }
    }

    /// An empty text element with default styling at the origin.
    pub fn text(id: ElementId, name: impl Into<String>) -> Self {
        let mut attrs = BTreeMap::new();
        attrs.insert("content".into(), Value::from(""));
        attrs.insert("alignment".into(), Value::from("left"));
        attrs.insert("color".into(), Value::from("#000000"));
        attrs.insert("fontSize".into(), Value::from(12));
        attrs.insert("fontFamily".into(), Value::from("Inter"));
        Self {
            id,
            kind: ElementKind::Text,
            name: name.into(),
            x: 0.0,
            y: 0.0,
            parent: None,
            attrs,
        }
    }

    /// Default element of the given kind.
    pub fn with_defaults(kind: ElementKind, id: ElementId, name: impl Into<String>) -> Self {
        match kind {
            ElementKind::Block => Self::block(id, name),
            ElementKind::Text => Self::text(id, name),
        }
    }

    /// Read one attribute by wire name, common fields included.
    pub fn attr(&self, key: &str) -> Option<Value> {
        match key {
            "id" => Some(Value::from(self.id.clone())),
            "name" => Some(Value::from(self.name.clone())),
            "x" => Some(Value::from(self.x)),
            "y" => Some(Value::from(self.y)),
            "parent" => self.parent.clone().map(Value::from),
            _ => self.attrs.get(key).cloned(),
        }
    }

    /// Set one variant attribute. Convenience for post-creation edits.
    pub fn set_attr(&mut self, key: impl Into<String>, value: Value) {
        self.attrs.insert(key.into(), value);
    }

    /// Rewrite the named attributes in place.
    ///
    /// `Value::Null` clears the attribute (detaches for `parent`). `id` and
    /// `type` are immutable and ignored if present.
    pub fn apply_patch(&mut self, patch: &Patch) {
        for (key, value) in patch {
            match key.as_str() {
                "id" | "type" => {}
                "name" => {
                    if let Some(name) = value.as_str() {
                        self.name = name.to_string();
                    }
                }
                "x" => self.x = value.as_f64().unwrap_or(0.0),
                "y" => self.y = value.as_f64().unwrap_or(0.0),
                "parent" => self.parent = value.as_str().map(str::to_string),
                _ => {
                    if value.is_null() {
                        self.attrs.remove(key);
                    } else {
                        self.attrs.insert(key.clone(), value.clone());
                    }
                }
            }
        }
    }

    /// Attribute-level diff of `edited` against `base`.
    ///
    /// Returns only the attributes that changed; attributes present on `base`
    /// but removed on `edited` appear as `Value::Null` (clear). Used to turn
    /// post-creation edits into a single minimal update.
    pub fn diff(base: &Element, edited: &Element) -> Patch {
        let mut patch = Patch::new();
        if edited.name != base.name {
            patch.insert("name".into(), Value::from(edited.name.clone()));
        }
        if edited.x != base.x {
            patch.insert("x".into(), Value::from(edited.x));
        }
        if edited.y != base.y {
            patch.insert("y".into(), Value::from(edited.y));
        }
        if edited.parent != base.parent {
            let value = edited.parent.clone().map(Value::from).unwrap_or(Value::Null);
            patch.insert("parent".into(), value);
        }
        for (key, value) in &edited.attrs {
            if base.attrs.get(key) != Some(value) {
                patch.insert(key.clone(), value.clone());
            }
        }
        for key in base.attrs.keys() {
            if !edited.attrs.contains_key(key) {
                patch.insert(key.clone(), Value::Null);
            }
        }
        patch
    }

    /// Drop variant attributes outside the closed allow-list.
    ///
    /// Applied at trust boundaries (snapshot decode) so wire input cannot
    /// smuggle arbitrary fields into local state.
    pub fn sanitize(&mut self) {
        let kind = self.kind;
        self.attrs.retain(|key, _| {
            let keep = allowed_attr(kind, key);
            if !keep {
                log::warn!("dropping unknown attribute {key:?} on {} element", kind.label());
            }
            keep
        });
    }
}

/// Remove disallowed keys from a patch before it touches local state.
pub fn sanitize_patch(kind: ElementKind, patch: &mut Patch) {
    patch.retain(|key, _| {
        let keep = allowed_attr(kind, key);
        if !keep {
            log::warn!("dropping unknown attribute {key:?} from {} update", kind.label());
        }
        keep
    });
}
