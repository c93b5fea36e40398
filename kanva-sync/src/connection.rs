//! WebSocket connection lifecycle for a project's content channel.
//!
//! One manager owns "the current connection" for whatever project is being
//! tracked. The connection is exposed as a generation-tagged handle inside a
//! `watch` cell — a re-armable single-shot signal: the cell holds `None`
//! while connecting, resolves to `Some(handle)` on open, and is replaced by
//! a fresh `None` on every reconnect or project switch. Consumers await the
//! cell and re-validate generation identity after any suspension point;
//! anything operating on a superseded generation must be a no-op.
//!
//! Closure handling: a clean close (normal closure code) is terminal. Any
//! other ending — abnormal close code, stream error, failed connect —
//! schedules exactly one reconnect attempt after a fixed delay, which is
//! itself a no-op if the tracked project changed or a newer connection
//! exists by the time the delay elapses. Socket errors never surface to
//! caller code; the worst outcome is a temporarily stale local view,
//! recovered by the snapshot the server sends on every fresh open.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{Command, ProtocolError};

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Base URL, e.g. `ws://127.0.0.1:8000` or `wss://host`.
    pub server_url: String,
    /// Fixed delay before the single reconnect attempt. No backoff.
    pub reconnect_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8000".to_string(),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Events delivered to the session, tagged with the generation of the socket
/// that produced them so stale handlers can be ignored.
#[derive(Debug)]
pub enum Inbound {
    /// The socket opened and the handle resolved.
    Connected { generation: u64 },
    /// A decoded frame from the currently active socket.
    Frame { generation: u64, command: Command },
    /// The socket ended. `clean` distinguishes explicit normal closure
    /// (terminal) from everything else (reconnect scheduled).
    Disconnected { generation: u64, clean: bool },
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(String),
    Close,
}

/// The currently active socket, once open.
///
/// Cheap to clone; a captured handle may outlive the connection it belongs
/// to, which is why every consumer re-validates with
/// [`ConnectionManager::is_current`] after resuming from an await.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    generation: u64,
    outgoing: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a frame on this connection's writer.
    pub async fn send(&self, frame: String) -> Result<(), ProtocolError> {
        self.outgoing
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}

struct Shared {
    config: ConnectionConfig,
    /// Latest issued connection generation. A socket or resumed handler
    /// whose generation differs is stale.
    generation: AtomicU64,
    /// Tracked project, consulted when a reconnect timer fires.
    project: Mutex<Option<String>>,
    handle_tx: watch::Sender<Option<ConnectionHandle>>,
    inbound_tx: mpsc::Sender<Inbound>,
}

/// Owns the socket lifecycle for the tracked project.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a manager that reports inbound events on `inbound_tx`.
    pub fn new(config: ConnectionConfig, inbound_tx: mpsc::Sender<Inbound>) -> Self {
        let (handle_tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                config,
                generation: AtomicU64::new(0),
                project: Mutex::new(None),
                handle_tx,
                inbound_tx,
            }),
        }
    }

    /// Switch the tracked project.
    ///
    /// Synchronously supersedes any existing socket (its generation becomes
    /// stale and its writer is asked to close) and installs a fresh
    /// unresolved handle. For `Some`, a new connection attempt starts
    /// immediately.
    pub fn set_project(&self, project: Option<String>) {
        let generation = {
            let mut tracked = self.shared.project.lock().unwrap();
            *tracked = project.clone();
            self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        if let Some(previous) = self.shared.handle_tx.send_replace(None) {
            let _ = previous.outgoing.try_send(Outbound::Close);
        }
        if let Some(project) = project {
            log::info!("connecting to project {project}");
            spawn_connection(self.shared.clone(), generation, project);
        }
    }

    /// The tracked project id, if any.
    pub fn project(&self) -> Option<String> {
        self.shared.project.lock().unwrap().clone()
    }

    /// The resolved handle, if a connection is currently open.
    pub fn current(&self) -> Option<ConnectionHandle> {
        self.shared.handle_tx.borrow().clone()
    }

    /// Whether `handle` still refers to the latest connection generation.
    pub fn is_current(&self, handle: &ConnectionHandle) -> bool {
        self.is_current_generation(handle.generation)
    }

    /// Whether `generation` is still the latest issued generation. Consumers
    /// of generation-tagged events use this to discard output of superseded
    /// sockets.
    pub fn is_current_generation(&self, generation: u64) -> bool {
        generation == self.shared.generation.load(Ordering::SeqCst)
    }

    /// Suspend until a connection is open, then return its handle.
    ///
    /// The returned handle is current at the moment of resolution; callers
    /// that suspend again afterwards must re-validate with
    /// [`Self::is_current`].
    pub async fn wait_connected(&self) -> Result<ConnectionHandle, ProtocolError> {
        if self.project().is_none() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let mut rx = self.shared.handle_tx.subscribe();
        let slot = rx
            .wait_for(|slot| slot.is_some())
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        slot.clone().ok_or(ProtocolError::ConnectionClosed)
    }
}

/// A handle whose writer end is the returned receiver, for exercising send
/// paths without a socket.
#[cfg(test)]
pub(crate) fn test_handle(generation: u64) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
    let (outgoing, rx) = mpsc::channel(8);
    (ConnectionHandle { generation, outgoing }, rx)
}

/// Start a connection attempt for `generation` on a background task.
fn spawn_connection(shared: Arc<Shared>, generation: u64, project: String) {
    tokio::spawn(run_connection(shared, generation, project));
}

/// After an unclean ending, arrange the single delayed reconnect attempt.
///
/// No second attempt is ever scheduled for the same generation: only the
/// task that owned the generation reaches this point, once.
async fn reconnect_later(shared: Arc<Shared>, generation: u64, project: String) {
    tokio::time::sleep(shared.config.reconnect_delay).await;
    if shared.generation.load(Ordering::SeqCst) != generation {
        // A newer connection or an explicit switch got there first.
        return;
    }
    let tracked = shared.project.lock().unwrap().clone();
    match tracked {
        Some(current) if current == project => {
            let next = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            log::info!("reconnecting to project {project}");
            spawn_connection(shared.clone(), next, project);
        }
        _ => {}
    }
}

async fn run_connection(shared: Arc<Shared>, generation: u64, project: String) {
    let url = format!(
        "{}/ws/projects/{}/content",
        shared.config.server_url, project
    );

    let mut ws = match connect_async(&url).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            log::warn!("connect to {url} failed: {e}");
            reconnect_later(shared, generation, project).await;
            return;
        }
    };

    // Open race: a fresh explicit connect may have superseded this attempt
    // while the socket was opening. The newer one wins; this one closes
    // without ever resolving the handle.
    if shared.generation.load(Ordering::SeqCst) != generation {
        let _ = ws.close(None).await;
        return;
    }

    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(256);

    // Writer task: forward the outgoing channel to the socket.
    tokio::spawn(async move {
        while let Some(outbound) = out_rx.recv().await {
            match outbound {
                Outbound::Frame(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let handle = ConnectionHandle {
        generation,
        outgoing: out_tx.clone(),
    };
    let resolved = shared.handle_tx.send_if_modified(|slot| {
        if shared.generation.load(Ordering::SeqCst) == generation {
            *slot = Some(handle);
            true
        } else {
            false
        }
    });
    if !resolved {
        let _ = out_tx.try_send(Outbound::Close);
        return;
    }
    log::info!("connected to project {project}");
    if shared
        .inbound_tx
        .send(Inbound::Connected { generation })
        .await
        .is_err()
    {
        return;
    }

    // Reader loop. Every resumption re-checks that this socket is still the
    // active one; a superseded socket's frames are discarded and it stops
    // without scheduling a reconnect.
    let mut clean = false;
    while let Some(message) = stream.next().await {
        if shared.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        match message {
            Ok(Message::Text(text)) => match Command::decode(text.as_str()) {
                Ok(command) => {
                    if shared
                        .inbound_tx
                        .send(Inbound::Frame {
                            generation,
                            command,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => log::warn!("dropping inbound frame: {e}"),
            },
            Ok(Message::Close(frame)) => {
                clean = matches!(&frame, Some(f) if f.code == CloseCode::Normal);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("socket error on project {project}: {e}");
                break;
            }
        }
    }

    if shared.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    shared.handle_tx.send_if_modified(|slot| {
        match slot {
            Some(active) if active.generation == generation => {
                *slot = None;
                true
            }
            _ => false,
        }
    });
    let _ = shared
        .inbound_tx
        .send(Inbound::Disconnected { generation, clean })
        .await;

    if clean {
        log::info!("connection to project {project} closed cleanly");
        return;
    }
    reconnect_later(shared, generation, project).await;
}
