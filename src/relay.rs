//! WebSocket relay: the sync authority.
//!
//! Architecture:
//! ```text
//! Replica A ──┐
//!              ├── RelayServer ── Mutex{ entities, delta log } ── SnapshotStore
//! Replica B ──┘        │
//!                      └── FanOut (connection table, sender excluded)
//! ```
//!
//! The relay has no authority over content — it orders deltas (arrival
//! order is the canonical sequence), applies the same merge rules as every
//! replica, persists a whole-state snapshot after each mutation, and
//! re-broadcasts each received `delta` frame verbatim to every other
//! session. Log and materialized state live behind a single mutex so at
//! most one mutation is ever in flight.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify, RwLock};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::fanout::FanOut;
use crate::merge::{self, EntityMap};
use crate::protocol::{Delta, Envelope};
use crate::store::{RelaySnapshot, SnapshotStore, StoreError};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per session before drops start
    pub channel_capacity: usize,
    /// Snapshot file path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Maximum deltas retained in the log. A replica whose position
    /// predates the retained suffix gets a full-state snapshot instead of
    /// a delta tail. None keeps the log forever.
    pub retention: Option<usize>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            channel_capacity: 256,
            storage_path: None,
            retention: None,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub deltas_appended: u64,
    pub snapshots_served: u64,
}

/// Outbound frame for a session's send queue.
#[derive(Debug, Clone)]
enum Frame {
    /// Serialized envelope, shared across sessions without re-encoding
    Text(Arc<String>),
    /// Ask the session task to close its socket (server shutdown)
    Close,
}

/// Canonical log and materialized state, owned as one unit.
///
/// All access goes through one `Mutex<SyncState>`, so apply, append,
/// trim, and persist happen as a single step per incoming batch.
#[derive(Debug, Default)]
struct SyncState {
    entities: EntityMap,
    deltas: Vec<Delta>,
    /// Canonical index of `deltas[0]` (nonzero after retention trimming)
    first_delta_id: u64,
}

/// Catch-up reply decision for a `sync` request.
#[derive(Debug, Clone, PartialEq)]
enum CatchUp {
    /// Requested position is at or past the log end — nothing to send
    UpToDate,
    /// The missing log tail
    Tail(Vec<Delta>),
    /// Position predates the retained log — full resync required
    Snapshot {
        entities: EntityMap,
        last_delta_id: u64,
    },
}

impl SyncState {
    /// One past the canonical index of the newest delta.
    fn log_end(&self) -> u64 {
        self.first_delta_id + self.deltas.len() as u64
    }

    /// Apply a delta to the materialized state and append it to the log.
    fn append(&mut self, delta: Delta) {
        merge::apply(&mut self.entities, &delta);
        self.deltas.push(delta);
    }

    /// Drop the oldest deltas beyond the retention limit.
    fn enforce_retention(&mut self, retention: Option<usize>) {
        if let Some(max) = retention {
            if self.deltas.len() > max {
                let excess = self.deltas.len() - max;
                self.deltas.drain(..excess);
                self.first_delta_id += excess as u64;
            }
        }
    }

    /// Decide the catch-up reply for a replica at `last_delta_id`.
    fn catch_up(&self, last_delta_id: u64) -> CatchUp {
        if last_delta_id < self.first_delta_id {
            return CatchUp::Snapshot {
                entities: self.entities.clone(),
                last_delta_id: self.log_end(),
            };
        }
        if last_delta_id >= self.log_end() {
            // Past-the-end requests are "already up to date", not an error
            return CatchUp::UpToDate;
        }
        let offset = (last_delta_id - self.first_delta_id) as usize;
        CatchUp::Tail(self.deltas[offset..].to_vec())
    }

    fn to_snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            entities: self.entities.clone(),
            first_delta_id: self.first_delta_id,
            deltas: self.deltas.clone(),
        }
    }

    fn restore(&mut self, snapshot: RelaySnapshot) {
        self.entities = snapshot.entities;
        self.first_delta_id = snapshot.first_delta_id;
        self.deltas = snapshot.deltas;
    }
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    /// Canonical `{state, log}` unit
    state: Arc<Mutex<SyncState>>,
    /// Connection table: clientId → session send queue
    connections: Arc<FanOut<Frame>>,
    stats: Arc<RwLock<RelayStats>>,
    store: Option<Arc<SnapshotStore<RelaySnapshot>>>,
    shutdown: Arc<Notify>,
}

impl RelayServer {
    /// Create a relay with the given configuration.
    pub fn new(config: RelayConfig) -> Self {
        let connections = Arc::new(FanOut::new(config.channel_capacity));
        let store = config
            .storage_path
            .as_ref()
            .map(|path| Arc::new(SnapshotStore::new(path.clone())));

        Self {
            config,
            state: Arc::new(Mutex::new(SyncState::default())),
            connections,
            stats: Arc::new(RwLock::new(RelayStats::default())),
            store,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Create with persistence enabled at the given snapshot path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let config = RelayConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..RelayConfig::default()
        };
        Self::new(config)
    }

    /// Restore persisted state on startup. Returns the restored log length.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let store = match &self.store {
            Some(s) => s,
            None => return Ok(0),
        };
        let snapshot = store.load().await?;
        let restored = snapshot.deltas.len();
        self.state.lock().await.restore(snapshot);
        if restored > 0 {
            log::info!("Recovered {restored} deltas from {}", store.path().display());
        }
        Ok(restored)
    }

    /// Run the relay event loop until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.recover().await?;

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let state = self.state.clone();
                    let connections = self.connections.clone();
                    let stats = self.stats.clone();
                    let store = self.store.clone();
                    let retention = self.config.retention;

                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(
                            stream, state, connections, stats, store, retention,
                        )
                        .await
                        {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = self.shutdown.notified() => break,
            }
        }

        // Proactively close every open session so clients observe a clean
        // disconnect instead of a timeout
        let closed = self.connections.broadcast(Frame::Close, None).await;
        log::info!("Relay shutting down, closed {closed} sessions");
        Ok(())
    }

    /// Signal the event loop to stop and close all open connections.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Handle one WebSocket session to completion.
    async fn handle_connection(
        stream: TcpStream,
        state: Arc<Mutex<SyncState>>,
        connections: Arc<FanOut<Frame>>,
        stats: Arc<RwLock<RelayStats>>,
        store: Option<Arc<SnapshotStore<RelaySnapshot>>>,
        retention: Option<usize>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Ephemeral session identity, never reused
        let client_id = Uuid::new_v4();
        let mut broadcast_rx = connections.register_with_id(client_id).await;

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let connected = Envelope::Connected { client_id }.encode()?;
        ws_sender.send(Message::Text(connected.into())).await?;
        log::info!("Client connected: {client_id}");

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                            }
                            if let Err(e) = Self::handle_envelope(
                                text.as_str(),
                                client_id,
                                &mut ws_sender,
                                &state,
                                &connections,
                                &stats,
                                &store,
                                retention,
                            )
                            .await
                            {
                                log::error!("Session {client_id} send failed: {e}");
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed: {client_id}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error for {client_id}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }
                frame = broadcast_rx.recv() => {
                    match frame {
                        Some(Frame::Text(text)) => {
                            ws_sender.send(Message::Text(text.as_str().into())).await?;
                        }
                        Some(Frame::Close) => {
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        connections.remove(&client_id).await;
        let mut s = stats.write().await;
        s.active_connections -= 1;
        Ok(())
    }

    /// Dispatch one inbound envelope.
    #[allow(clippy::too_many_arguments)]
    async fn handle_envelope(
        raw: &str,
        client_id: Uuid,
        ws_sender: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
        state: &Mutex<SyncState>,
        connections: &FanOut<Frame>,
        stats: &RwLock<RelayStats>,
        store: &Option<Arc<SnapshotStore<RelaySnapshot>>>,
        retention: Option<usize>,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let envelope = match Envelope::decode(raw) {
            Ok(e) => e,
            Err(e) => {
                // Malformed frames are dropped; the connection survives
                log::warn!("Dropping malformed message from {client_id}: {e}");
                return Ok(());
            }
        };

        match envelope {
            Envelope::Ping => {
                // A failed encode skips the reply; never send an empty frame
                match Envelope::Pong.encode() {
                    Ok(pong) => ws_sender.send(Message::Text(pong.into())).await?,
                    Err(e) => log::error!("Failed to encode pong for {client_id}: {e}"),
                }
            }

            Envelope::Sync { last_delta_id } => {
                let reply = {
                    let state = state.lock().await;
                    state.catch_up(last_delta_id)
                };
                match reply {
                    CatchUp::UpToDate => {}
                    CatchUp::Tail(deltas) => {
                        log::info!(
                            "Catch-up for {client_id}: {} deltas from {last_delta_id}",
                            deltas.len()
                        );
                        match Envelope::Delta(deltas).encode() {
                            Ok(text) => ws_sender.send(Message::Text(text.into())).await?,
                            Err(e) => {
                                log::error!("Failed to encode catch-up for {client_id}: {e}")
                            }
                        }
                    }
                    CatchUp::Snapshot {
                        entities,
                        last_delta_id,
                    } => {
                        log::info!("Full resync for {client_id} (position predates retention)");
                        stats.write().await.snapshots_served += 1;
                        let snapshot = Envelope::Snapshot {
                            entities,
                            last_delta_id,
                        };
                        match snapshot.encode() {
                            Ok(text) => ws_sender.send(Message::Text(text.into())).await?,
                            Err(e) => {
                                log::error!("Failed to encode snapshot for {client_id}: {e}")
                            }
                        }
                    }
                }
            }

            Envelope::Delta(deltas) => {
                let count = deltas.len() as u64;
                // Apply, append and persist under the one state lock; the
                // snapshot write is the only suspension point inside it
                let persisted = {
                    let mut state = state.lock().await;
                    for delta in deltas {
                        state.append(delta);
                    }
                    state.enforce_retention(retention);
                    match store {
                        Some(store) => match store.save(&state.to_snapshot()).await {
                            Ok(()) => true,
                            Err(e) => {
                                log::error!("Failed to persist relay snapshot: {e}");
                                false
                            }
                        },
                        None => true,
                    }
                };
                stats.write().await.deltas_appended += count;

                // A failed persist aborts the broadcast; in-memory state is
                // intact and the next mutation rewrites the whole snapshot
                if persisted {
                    connections
                        .broadcast(Frame::Text(Arc::new(raw.to_string())), Some(client_id))
                        .await;
                }
            }

            other => {
                log::debug!("Unhandled envelope from {client_id}: {other:?}");
            }
        }
        Ok(())
    }

    /// Current canonical log length (including trimmed prefix).
    pub async fn log_end(&self) -> u64 {
        self.state.lock().await.log_end()
    }

    /// Copy of the materialized state.
    pub async fn materialized(&self) -> EntityMap {
        self.state.lock().await.entities.clone()
    }

    /// Relay statistics snapshot.
    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Number of live sessions.
    pub async fn connection_count(&self) -> usize {
        self.connections.count().await
    }

    /// The configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
