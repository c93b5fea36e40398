//! # kanva-sync — client-side sync engine for the Kanva canvas
//!
//! Keeps a local mirror of a project's element tree consistent with the
//! authoritative server copy over a persistent websocket, while local edits
//! apply optimistically and rapid attribute changes coalesce before hitting
//! the wire.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   user calls    ┌─────────────┐
//! │ ProjectSession │ ◄────────────── │ UI layer    │
//! └───────┬────────┘                 └─────────────┘
//!         │ optimistic mutation
//!         ▼
//! ┌─────────────┐  attribute diffs  ┌───────────────┐
//! │ ProjectTree │ ────────────────► │ UpdateBatcher │── 100 ms flush
//! │ (local)     │                   └───────┬───────┘
//! └──────▲──────┘                           │ sent copies
//!        │ apply-or-suppress                ▼
//! ┌──────┴─────────┐  inbound   ┌───────────────────┐
//! │ EchoReconciler │ ◄───────── │ ConnectionManager │ ◄──► server
//! └────────────────┘   frames   └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — textual wire codec (`<token> <json>`, bare-array
//!   snapshots)
//! - [`batcher`] — per-element coalescing of outgoing attribute updates
//! - [`reconcile`] — bounded ring of sent payloads for echo suppression
//! - [`connection`] — socket lifecycle, generation-tagged handles,
//!   fixed-delay reconnect
//! - [`session`] — the per-project context object tying it all together
//!
//! No CRDT/OT convergence is attempted: the protocol is last-write-wins at
//! attribute granularity with a best-effort echo filter.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

pub mod batcher;
pub mod connection;
pub mod protocol;
pub mod reconcile;
pub mod session;

pub use batcher::UpdateBatcher;
pub use connection::{ConnectionConfig, ConnectionHandle, ConnectionManager, Inbound};
pub use protocol::{Command, ProtocolError};
pub use reconcile::{EchoOutcome, EchoReconciler};
pub use session::{ProjectSession, SessionConfig, SessionEvent};
