//! # kanva-core — element model and tree store for the Kanva canvas
//!
//! The data half of the sync engine: a flat, ordered collection of design
//! elements with parent back-references, plus every structural mutation the
//! protocol can express (create, attribute update, cascade delete, reparent,
//! reorder). Pure and synchronous — no sockets, no timers; `kanva-sync`
//! wires these mutations to the server.
//!
//! ## Modules
//!
//! - [`element`] — `Element` (Block/Text variants), attribute patches, the
//!   closed per-variant attribute sets, defaults and diffing
//! - [`tree`] — `ProjectTree`: the ordered collection and its invariants
//!   (no cycles, absolute-position-preserving reparents, global ordering)
//! - [`validate`] — read-only drag-and-drop predicates for UI layers

pub mod element;
pub mod tree;
pub mod validate;

pub use element::{
    allowed_attr, generate_element_id, sanitize_patch, Element, ElementId, ElementKind, Patch,
};
pub use tree::ProjectTree;
