//! Per-project session: the one explicit context object.
//!
//! Owns the local tree mirror, the update batcher, the echo ring and the
//! connection manager, plus the two background tasks — the periodic flush
//! ticker and the inbound applier. Everything a project needs lives here
//! and is torn down here; no ambient module state survives a project
//! switch.
//!
//! Control flow:
//! ```text
//! user call ──► ProjectTree (optimistic, synchronous)
//!       │
//!       ├── create/delete/put ──► immediate frame (awaits connection)
//!       └── attribute update  ──► UpdateBatcher ──► 100 ms flush tick
//!                                                      │
//!                                                      ▼
//!                                             EchoReconciler ring
//!
//! socket ──► Codec ──► EchoReconciler ──► apply-or-suppress ──► ProjectTree
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use kanva_core::{
    generate_element_id, sanitize_patch, Element, ElementId, ElementKind, Patch, ProjectTree,
};

use crate::batcher::UpdateBatcher;
use crate::connection::{ConnectionConfig, ConnectionHandle, ConnectionManager, Inbound};
use crate::protocol::{Command, ProtocolError};
use crate::reconcile::{EchoOutcome, EchoReconciler};

/// Session tuning knobs. Defaults match the protocol's fixed constants.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base websocket URL, e.g. `ws://127.0.0.1:8000`.
    pub server_url: String,
    /// Flush window for coalesced attribute updates.
    pub flush_interval: Duration,
    /// Delay before the single reconnect attempt after an unclean close.
    pub reconnect_delay: Duration,
    /// Echo ring capacity. Bounds tracked round-trip latency, not
    /// correctness; see the reconciler docs before raising it.
    pub reconcile_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8000".to_string(),
            flush_interval: Duration::from_millis(100),
            reconnect_delay: Duration::from_secs(1),
            reconcile_capacity: 100,
        }
    }
}

/// Events surfaced to the embedding UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    /// A snapshot replaced the whole tree.
    TreeReplaced,
    /// A remote mutation touched one element.
    RemoteChange(ElementId),
}

/// A loaded project's synchronization context.
pub struct ProjectSession {
    config: SessionConfig,
    tree: Arc<RwLock<ProjectTree>>,
    batcher: Arc<Mutex<UpdateBatcher>>,
    reconciler: Arc<Mutex<EchoReconciler>>,
    manager: ConnectionManager,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
    flusher: Option<JoinHandle<()>>,
    applier: JoinHandle<()>,
}

impl ProjectSession {
    /// Create an idle session. Call [`Self::load_project`] to connect.
    pub fn new(config: SessionConfig) -> Self {
        let tree = Arc::new(RwLock::new(ProjectTree::new()));
        let batcher = Arc::new(Mutex::new(UpdateBatcher::new()));
        let reconciler = Arc::new(Mutex::new(EchoReconciler::new(config.reconcile_capacity)));
        let (event_tx, event_rx) = mpsc::channel(256);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        let manager = ConnectionManager::new(
            ConnectionConfig {
                server_url: config.server_url.clone(),
                reconnect_delay: config.reconnect_delay,
            },
            inbound_tx,
        );

        let applier = tokio::spawn(apply_inbound(
            inbound_rx,
            tree.clone(),
            reconciler.clone(),
            manager.clone(),
            event_tx,
        ));

        Self {
            config,
            tree,
            batcher,
            reconciler,
            manager,
            event_rx: Some(event_rx),
            flusher: None,
            applier,
        }
    }

    /// Open the project's content channel and start the flush ticker.
    ///
    /// Loading a different project first tears the previous one down,
    /// synchronously with the switch.
    pub async fn load_project(&mut self, project_id: impl Into<String>) {
        self.teardown().await;
        self.manager.set_project(Some(project_id.into()));
        self.flusher = Some(tokio::spawn(flush_loop(
            self.config.flush_interval,
            self.manager.clone(),
            self.batcher.clone(),
            self.reconciler.clone(),
        )));
    }

    /// Close the socket, cancel the ticker and clear all local state.
    pub async fn unload(&mut self) {
        self.teardown().await;
        self.manager.set_project(None);
    }

    async fn teardown(&mut self) {
        if let Some(flusher) = self.flusher.take() {
            flusher.abort();
        }
        self.tree.write().await.clear();
        self.batcher.lock().await.clear();
        self.reconciler.lock().await.clear();
    }

    /// The local tree mirror.
    pub fn tree(&self) -> Arc<RwLock<ProjectTree>> {
        self.tree.clone()
    }

    /// Take the session event receiver (can only be taken once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Create an element of `kind`, optionally editing it before it is
    /// announced.
    ///
    /// The element gets a fresh id, a default `"{label} {N}"` name and the
    /// last spot in the global order. The create frame goes out immediately
    /// (identity only); the caller's edits are diffed against the defaults
    /// and scheduled as one batched update carrying just the changes.
    pub async fn create(
        &self,
        kind: ElementKind,
        edit: Option<impl FnOnce(&mut Element)>,
    ) -> Result<Element, ProtocolError> {
        let (element, default_name, edits) = {
            let mut tree = self.tree.write().await;
            let id = generate_element_id();
            let name = format!("{} {}", kind.label(), tree.count_of(kind) + 1);
            let default = Element::with_defaults(kind, id, name);
            let mut element = default.clone();
            if let Some(edit) = edit {
                edit(&mut element);
                // Identity is not editable.
                element.id = default.id.clone();
                element.kind = default.kind;
            }
            let mut edits = Element::diff(&default, &element);
            sanitize_patch(kind, &mut edits);
            tree.insert(element.clone());
            (element, default.name, edits)
        };

        // The create frame announces identity with the default name; a name
        // edit travels in the diff like any other attribute.
        self.send_now(Command::Create {
            id: element.id.clone(),
            kind,
            name: default_name,
        })
        .await?;

        if !edits.is_empty() {
            self.batcher.lock().await.schedule(&element.id, edits);
        }
        Ok(element)
    }

    /// [`Self::create`] for a block.
    pub async fn create_block(
        &self,
        edit: Option<impl FnOnce(&mut Element)>,
    ) -> Result<Element, ProtocolError> {
        self.create(ElementKind::Block, edit).await
    }

    /// [`Self::create`] for a text element.
    pub async fn create_text(
        &self,
        edit: Option<impl FnOnce(&mut Element)>,
    ) -> Result<Element, ProtocolError> {
        self.create(ElementKind::Text, edit).await
    }

    /// Apply an attribute patch locally and schedule it for the next flush.
    ///
    /// Returns immediately (enqueue-only); the flush tick performs the send.
    /// Unknown attributes for the element's variant are dropped at this
    /// boundary. False if the element does not exist.
    pub async fn update(&self, id: &str, mut patch: Patch) -> bool {
        let applied = {
            let mut tree = self.tree.write().await;
            let kind = match tree.get(id) {
                Some(element) => element.kind,
                None => return false,
            };
            sanitize_patch(kind, &mut patch);
            !patch.is_empty() && tree.update(id, &patch)
        };
        if applied {
            self.batcher.lock().await.schedule(id, patch);
        }
        applied
    }

    /// Remove `id` and its whole subtree locally; emit one delete for the
    /// root id only. The remote side cascades and echoes per-descendant
    /// deletes, which apply as ordinary idempotent deletes.
    pub async fn remove(&self, id: &str) -> Result<(), ProtocolError> {
        let removed = self.tree.write().await.remove_cascade(id);
        if removed.is_empty() {
            return Ok(());
        }
        self.batcher.lock().await.forget(&removed);
        self.send_now(Command::Delete { id: id.to_string() }).await
    }

    /// Reparent `id` under `new_parent` (or detach to root), keeping its
    /// absolute position. Structurally invalid moves are silently rejected;
    /// accepted ones schedule the single `{parent, x, y}` diff.
    pub async fn make_child(&self, id: &str, new_parent: Option<&str>) -> bool {
        let patch = self.tree.write().await.make_child(id, new_parent);
        match patch {
            Some(patch) => {
                self.batcher.lock().await.schedule(id, patch);
                true
            }
            None => false,
        }
    }

    /// Move `id` immediately after `after` in the global order. Sent
    /// immediately, never batched.
    pub async fn put_after(&self, id: &str, after: Option<&str>) -> Result<bool, ProtocolError> {
        let moved = self.tree.write().await.put_after(id, after);
        if !moved {
            return Ok(false);
        }
        self.send_now(Command::Put {
            id: id.to_string(),
            after: after.map(str::to_string),
        })
        .await?;
        Ok(true)
    }

    /// Select an element (or clear the selection).
    pub async fn select(&self, id: Option<ElementId>) {
        self.tree.write().await.select(id);
    }

    /// Send an immediate command, suspending until a connection exists.
    async fn send_now(&self, command: Command) -> Result<(), ProtocolError> {
        let handle = self.manager.wait_connected().await?;
        if !self.manager.is_current(&handle) {
            // Swapped out between resolution and here; the replacement
            // connection's snapshot will carry the authoritative state.
            return Err(ProtocolError::ConnectionClosed);
        }
        handle.send(command.encode()).await
    }
}

impl Drop for ProjectSession {
    fn drop(&mut self) {
        if let Some(flusher) = &self.flusher {
            flusher.abort();
        }
        self.applier.abort();
    }
}

/// Periodic flush: drain the batcher once per window while a connection is
/// open, recording every sent payload in the echo ring.
async fn flush_loop(
    interval: Duration,
    manager: ConnectionManager,
    batcher: Arc<Mutex<UpdateBatcher>>,
    reconciler: Arc<Mutex<EchoReconciler>>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let handle = match manager.current() {
            Some(handle) if manager.is_current(&handle) => handle,
            // Not connected: pending updates stay queued for a later tick.
            _ => continue,
        };
        flush_pending(&handle, &batcher, &reconciler).await;
    }
}

/// Send every pending update on `handle`, recording sent copies for echo
/// matching. When a send fails mid-flush, the failed entry and everything
/// after it go back into the batcher so a later tick retries them.
async fn flush_pending(
    handle: &ConnectionHandle,
    batcher: &Arc<Mutex<UpdateBatcher>>,
    reconciler: &Arc<Mutex<EchoReconciler>>,
) {
    let drained = batcher.lock().await.drain();
    let mut failed_at = None;
    for (index, (id, patch)) in drained.iter().enumerate() {
        let frame = Command::Update {
            id: id.clone(),
            patch: patch.clone(),
        }
        .encode();
        if handle.send(frame).await.is_err() {
            failed_at = Some(index);
            break;
        }
        reconciler.lock().await.observe_sent(id, patch);
    }
    if let Some(index) = failed_at {
        log::warn!(
            "connection gone mid-flush, requeueing {} updates",
            drained.len() - index
        );
        let mut batcher = batcher.lock().await;
        for (id, patch) in drained.into_iter().skip(index) {
            batcher.requeue(&id, patch);
        }
    }
}

/// Inbound applier: decode results from the connection layer, reconciled
/// and folded into the tree.
///
/// Every event carries the generation of the socket that produced it; events
/// already queued when a project switch superseded that socket are discarded
/// here, so a foreign project's frames never reach the tree.
async fn apply_inbound(
    mut inbound_rx: mpsc::Receiver<Inbound>,
    tree: Arc<RwLock<ProjectTree>>,
    reconciler: Arc<Mutex<EchoReconciler>>,
    manager: ConnectionManager,
    event_tx: mpsc::Sender<SessionEvent>,
) {
    while let Some(inbound) = inbound_rx.recv().await {
        match inbound {
            Inbound::Connected { generation } => {
                if !manager.is_current_generation(generation) {
                    continue;
                }
                let _ = event_tx.send(SessionEvent::Connected).await;
            }
            Inbound::Disconnected { generation, .. } => {
                if !manager.is_current_generation(generation) {
                    continue;
                }
                let _ = event_tx.send(SessionEvent::Disconnected).await;
            }
            Inbound::Frame {
                generation,
                command,
            } => {
                if !manager.is_current_generation(generation) {
                    log::debug!("discarding frame from superseded connection");
                    continue;
                }
                if let Some(event) = apply_command(&tree, &reconciler, command).await {
                    let _ = event_tx.send(event).await;
                }
            }
        }
    }
}

/// Fold one inbound command into local state.
async fn apply_command(
    tree: &Arc<RwLock<ProjectTree>>,
    reconciler: &Arc<Mutex<EchoReconciler>>,
    command: Command,
) -> Option<SessionEvent> {
    match command {
        Command::Snapshot(mut elements) => {
            for element in &mut elements {
                element.sanitize();
            }
            log::info!("applying snapshot of {} elements", elements.len());
            tree.write().await.replace_all(elements);
            // Records sent on the previous socket can never be echoed now.
            reconciler.lock().await.clear();
            Some(SessionEvent::TreeReplaced)
        }
        Command::Create { id, kind, name } => {
            tree.write()
                .await
                .insert(Element::with_defaults(kind, id.clone(), name));
            Some(SessionEvent::RemoteChange(id))
        }
        Command::Update { id, mut patch } => {
            match reconciler.lock().await.classify(&id, &patch) {
                EchoOutcome::OwnEcho => None,
                EchoOutcome::ConcurrentConflict | EchoOutcome::Remote => {
                    let mut tree = tree.write().await;
                    let kind = tree.get(&id)?.kind;
                    sanitize_patch(kind, &mut patch);
                    tree.update(&id, &patch);
                    Some(SessionEvent::RemoteChange(id))
                }
            }
        }
        Command::Delete { id } => {
            let removed = tree.write().await.remove_cascade(&id);
            if removed.is_empty() {
                None
            } else {
                Some(SessionEvent::RemoteChange(id))
            }
        }
        Command::Put { id, after } => {
            let moved = tree.write().await.put_after(&id, after.as_deref());
            moved.then(|| SessionEvent::RemoteChange(id))
        }
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

    fn harness() -> (Arc<RwLock<ProjectTree>>, Arc<Mutex<EchoReconciler>>) {
        (
            Arc::new(RwLock::new(ProjectTree::new())),
            Arc::new(Mutex::new(EchoReconciler::new(100))),
        )
    }

    #[tokio::test]
    async fn test_apply_snapshot_replaces_tree() {
        let (tree, reconciler) = harness();
        tree.write().await.insert(Element::block("old".into(), "Block 1"));
        reconciler
            .lock()
            .await
            .observe_sent("old", &patch(&[("x", json!(1))]));

        let snapshot = Command::Snapshot(vec![Element::block("new".into(), "Block 1")]);
        let event = apply_command(&tree, &reconciler, snapshot).await;
        assert_eq!(event, Some(SessionEvent::TreeReplaced));
        assert!(tree.read().await.get("old").is_none());
        assert!(tree.read().await.get("new").is_some());
        // Stale echo records were discarded with the old tree.
        assert!(reconciler.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_own_echo_is_suppressed() {
        let (tree, reconciler) = harness();
        let mut el = Element::block("5".into(), "Block 1");
        el.x = 20.0;
        tree.write().await.insert(el);

        // Local update x:20 already applied and sent.
        let sent = patch(&[("x", json!(20.0))]);
        reconciler.lock().await.observe_sent("5", &sent);

        let before = tree.read().await.get("5").cloned();
        let echo = Command::Update {
            id: "5".into(),
            patch: sent,
        };
        let event = apply_command(&tree, &reconciler, echo).await;
        assert_eq!(event, None);
        assert_eq!(tree.read().await.get("5").cloned(), before);
        assert!(reconciler.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_concurrent_update_wins() {
        let (tree, reconciler) = harness();
        tree.write().await.insert(Element::block("5".into(), "Block 1"));
        reconciler
            .lock()
            .await
            .observe_sent("5", &patch(&[("x", json!(20))]));

        let incoming = Command::Update {
            id: "5".into(),
            patch: patch(&[("x", json!(99))]),
        };
        let event = apply_command(&tree, &reconciler, incoming).await;
        assert_eq!(event, Some(SessionEvent::RemoteChange("5".into())));
        assert_eq!(tree.read().await.get("5").unwrap().x, 99.0);
        assert!(reconciler.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_remote_create_and_delete() {
        let (tree, reconciler) = harness();
        let create = Command::Create {
            id: "r1".into(),
            kind: ElementKind::Text,
            name: "Text 1".into(),
        };
        apply_command(&tree, &reconciler, create).await;
        assert_eq!(tree.read().await.get("r1").unwrap().kind, ElementKind::Text);

        let delete = Command::Delete { id: "r1".into() };
        apply_command(&tree, &reconciler, delete).await;
        assert!(tree.read().await.get("r1").is_none());

        // Echoed descendant deletes arrive for already-removed ids.
        let event = apply_command(&tree, &reconciler, Command::Delete { id: "r1".into() }).await;
        assert_eq!(event, None);
    }

    #[tokio::test]
    async fn test_apply_update_for_unknown_element_is_dropped() {
        let (tree, reconciler) = harness();
        let incoming = Command::Update {
            id: "ghost".into(),
            patch: patch(&[("x", json!(1))]),
        };
        let event = apply_command(&tree, &reconciler, incoming).await;
        assert_eq!(event, None);
        assert!(tree.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_update_strips_disallowed_attrs() {
        let (tree, reconciler) = harness();
        tree.write().await.insert(Element::text("t".into(), "Text 1"));
        let incoming = Command::Update {
            id: "t".into(),
            patch: patch(&[("width", json!(500)), ("content", json!("hi"))]),
        };
        apply_command(&tree, &reconciler, incoming).await;
        let tree = tree.read().await;
        let el = tree.get("t").unwrap();
        assert_eq!(el.attr("width"), None);
        assert_eq!(el.attr("content"), Some(json!("hi")));
    }

    #[tokio::test]
    async fn test_apply_put_reorders() {
        let (tree, reconciler) = harness();
        for id in ["A", "B", "C"] {
            tree.write()
                .await
                .insert(Element::block(id.into(), format!("Block {id}")));
        }
        let put = Command::Put {
            id: "A".into(),
            after: Some("B".into()),
        };
        apply_command(&tree, &reconciler, put).await;
        let tree = tree.read().await;
        let order: Vec<&str> = tree.elements().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(order, vec!["B", "A", "C"]);
    }

    #[tokio::test]
    async fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.flush_interval, Duration::from_millis(100));
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.reconcile_capacity, 100);
    }

    #[tokio::test]
    async fn test_applier_discards_frames_from_superseded_connection() {
        let (tree, reconciler) = harness();
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (inbound_tx, inbound_rx) = mpsc::channel(8);

        // Nothing listens on the port; tracking a project still bumps the
        // live generation past 0.
        let (manager_inbound_tx, _manager_inbound_rx) = mpsc::channel(8);
        let manager = ConnectionManager::new(
            ConnectionConfig {
                server_url: "ws://127.0.0.1:9".into(),
                reconnect_delay: Duration::from_secs(60),
            },
            manager_inbound_tx,
        );
        manager.set_project(Some("p".into()));

        tokio::spawn(apply_inbound(
            inbound_rx,
            tree.clone(),
            reconciler.clone(),
            manager.clone(),
            event_tx,
        ));

        // A frame queued by a reader whose socket was superseded.
        inbound_tx
            .send(Inbound::Frame {
                generation: 0,
                command: Command::Create {
                    id: "stale".into(),
                    kind: ElementKind::Block,
                    name: "Block 1".into(),
                },
            })
            .await
            .unwrap();
        inbound_tx
            .send(Inbound::Frame {
                generation: 1,
                command: Command::Create {
                    id: "live".into(),
                    kind: ElementKind::Block,
                    name: "Block 1".into(),
                },
            })
            .await
            .unwrap();

        // The live frame's event proves the stale one was already consumed.
        let event = tokio::time::timeout(Duration::from_secs(1), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, SessionEvent::RemoteChange("live".into()));
        assert!(tree.read().await.get("stale").is_none());
        assert!(tree.read().await.get("live").is_some());
    }

    #[tokio::test]
    async fn test_flush_sends_and_records_pending() {
        use crate::connection::{test_handle, Outbound};

        let batcher = Arc::new(Mutex::new(UpdateBatcher::new()));
        let reconciler = Arc::new(Mutex::new(EchoReconciler::new(100)));
        batcher.lock().await.schedule("5", patch(&[("x", json!(1))]));

        let (handle, mut out_rx) = test_handle(1);
        flush_pending(&handle, &batcher, &reconciler).await;

        assert!(batcher.lock().await.is_empty());
        assert_eq!(reconciler.lock().await.len(), 1);
        match out_rx.recv().await {
            Some(Outbound::Frame(text)) => {
                assert_eq!(text, r#"update {"id":"5","x":1}"#);
            }
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_flush_failure_requeues_unsent_updates() {
        use crate::connection::test_handle;

        let batcher = Arc::new(Mutex::new(UpdateBatcher::new()));
        let reconciler = Arc::new(Mutex::new(EchoReconciler::new(100)));
        batcher.lock().await.schedule("a", patch(&[("x", json!(1))]));
        batcher.lock().await.schedule("b", patch(&[("y", json!(2))]));

        // Writer gone: every send fails.
        let (handle, out_rx) = test_handle(1);
        drop(out_rx);
        flush_pending(&handle, &batcher, &reconciler).await;

        // Nothing was lost and nothing was recorded as sent.
        let batcher = batcher.lock().await;
        assert_eq!(batcher.len(), 2);
        assert!(reconciler.lock().await.is_empty());
    }
}
