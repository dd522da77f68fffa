//! The replica agent: one device's local mirror of the synced dataset.
//!
//! Runs beside the device's UI surfaces. Holds a materialized mirror (same
//! shape as the relay's), an outbound queue for deltas created while
//! offline, and a connection lifecycle that reconnects with a fixed
//! backoff. Multiple UI consumers on the same device share one agent; the
//! agent fans incoming state out to all of them through the same
//! [`FanOut`] pattern the relay uses for its connection table.
//!
//! Local writes are optimistic: a submitted delta hits the mirror before
//! it ever touches the network, so the UI never waits on a round trip.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::fanout::FanOut;
use crate::merge::{self, EntityMap};
use crate::protocol::{Delta, Envelope, ProtocolError};
use crate::store::{ReplicaSnapshot, SnapshotStore, StoreError};

/// Connection lifecycle state.
///
/// `Connecting` guards against duplicate concurrent connect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events fanned out to the local UI consumers sharing this agent.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// Connectivity changed — the only failure signal the UI layer sees
    Status { connected: bool },
    /// Deltas applied to the mirror (remote or from a sibling consumer)
    Deltas(Vec<Delta>),
    /// The mirror was replaced wholesale (initial attach or full resync)
    State(EntityMap),
}

/// Replica configuration.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Relay WebSocket URL
    pub relay_url: String,
    /// Replica state file (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Fixed delay before a reconnect attempt
    pub reconnect_delay: Duration,
    /// Heartbeat ping interval while connected
    pub heartbeat_interval: Duration,
    /// Per-consumer event buffer capacity
    pub channel_capacity: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8000".to_string(),
            storage_path: None,
            reconnect_delay: Duration::from_millis(3000),
            heartbeat_interval: Duration::from_secs(30),
            channel_capacity: 64,
        }
    }
}

/// Durable replica state: identity, sync position, queue, mirror.
#[derive(Debug, Default)]
struct Mirror {
    client_id: Option<Uuid>,
    last_delta_id: u64,
    queue: Vec<Delta>,
    entities: EntityMap,
}

impl Mirror {
    fn to_snapshot(&self) -> ReplicaSnapshot {
        ReplicaSnapshot {
            client_id: self.client_id,
            last_delta_id: self.last_delta_id,
            queue: self.queue.clone(),
            entities: self.entities.clone(),
        }
    }

    fn restore(&mut self, snapshot: ReplicaSnapshot) {
        self.client_id = snapshot.client_id;
        self.last_delta_id = snapshot.last_delta_id;
        self.queue = snapshot.queue;
        self.entities = snapshot.entities;
    }
}

/// The replica agent. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ReplicaAgent {
    config: ReplicaConfig,
    mirror: Arc<Mutex<Mirror>>,
    conn_state: Arc<RwLock<ConnectionState>>,
    /// Send half of the current connection's writer task
    outgoing: Arc<RwLock<Option<mpsc::Sender<String>>>>,
    /// Local UI consumers on this device
    consumers: Arc<FanOut<ReplicaEvent>>,
    store: Option<Arc<SnapshotStore<ReplicaSnapshot>>>,
    /// Signaled by the reader task when a connection ends
    disconnect: Arc<Notify>,
}

impl ReplicaAgent {
    /// Create an agent with empty state (nothing loaded from disk).
    pub fn new(config: ReplicaConfig) -> Self {
        let consumers = Arc::new(FanOut::new(config.channel_capacity));
        let store = config
            .storage_path
            .as_ref()
            .map(|path| Arc::new(SnapshotStore::new(path.clone())));

        Self {
            config,
            mirror: Arc::new(Mutex::new(Mirror::default())),
            conn_state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing: Arc::new(RwLock::new(None)),
            consumers,
            store,
            disconnect: Arc::new(Notify::new()),
        }
    }

    /// Create an agent and restore its persisted state, so a restart loses
    /// neither unsent deltas nor the sync position.
    pub async fn open(config: ReplicaConfig) -> Result<Self, StoreError> {
        let agent = Self::new(config);
        if let Some(store) = &agent.store {
            let snapshot = store.load().await?;
            agent.mirror.lock().await.restore(snapshot);
        }
        Ok(agent)
    }

    /// Run the connection lifecycle: connect, wait for the connection to
    /// end, back off, repeat — indefinitely.
    pub async fn run(&self) {
        loop {
            if self.connect().await.is_err() {
                tokio::time::sleep(self.config.reconnect_delay).await;
                continue;
            }
            self.disconnect.notified().await;
            // Fixed backoff before the next attempt
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }

    /// Attempt a single connection to the relay.
    ///
    /// Returns `Ok(())` without doing anything if a connection attempt is
    /// already in progress or established.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        {
            let mut cs = self.conn_state.write().await;
            if *cs != ConnectionState::Disconnected {
                return Ok(());
            }
            *cs = ConnectionState::Connecting;
        }

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.config.relay_url).await {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.config.relay_url);
                *self.conn_state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        let (mut ws_writer, ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel onto the socket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.config.channel_capacity);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });
        *self.outgoing.write().await = Some(out_tx.clone());
        *self.conn_state.write().await = ConnectionState::Connected;

        self.consumers
            .broadcast(ReplicaEvent::Status { connected: true }, None)
            .await;

        // Catch-up request, then replay anything queued while offline
        let last_delta_id = self.mirror.lock().await.last_delta_id;
        let sync = Envelope::Sync { last_delta_id }.encode()?;
        out_tx
            .send(sync)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.flush_queue().await;

        // Heartbeat: ends once the writer side is gone
        let heartbeat_tx = out_tx.clone();
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // consume the immediate first tick
            loop {
                ticker.tick().await;
                let Ok(ping) = Envelope::Ping.encode() else { break };
                if heartbeat_tx.send(ping).await.is_err() {
                    break;
                }
            }
        });

        // Reader task
        let agent = self.clone();
        tokio::spawn(async move {
            agent.read_loop(ws_reader).await;
        });

        Ok(())
    }

    /// Consume frames until the connection ends, then mark disconnected.
    async fn read_loop(
        &self,
        mut ws_reader: impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    ) {
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(Message::Text(text)) => self.handle_frame(text.as_str()).await,
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    log::error!("WebSocket error: {e}");
                    break;
                }
                _ => {}
            }
        }

        *self.conn_state.write().await = ConnectionState::Disconnected;
        *self.outgoing.write().await = None;
        self.consumers
            .broadcast(ReplicaEvent::Status { connected: false }, None)
            .await;
        self.disconnect.notify_one();
        log::info!("Disconnected from relay");
    }

    /// Dispatch one inbound envelope.
    async fn handle_frame(&self, raw: &str) {
        let envelope = match Envelope::decode(raw) {
            Ok(e) => e,
            Err(e) => {
                // Malformed frames are dropped; the connection survives
                log::warn!("Dropping malformed message from relay: {e}");
                return;
            }
        };

        match envelope {
            Envelope::Connected { client_id } => {
                let mut mirror = self.mirror.lock().await;
                if mirror.client_id.is_none() {
                    mirror.client_id = Some(client_id);
                    self.persist(&mirror).await;
                }
                log::info!("Relay issued session id {client_id}");
            }

            Envelope::Delta(deltas) => {
                {
                    let mut mirror = self.mirror.lock().await;
                    merge::apply_all(&mut mirror.entities, &deltas);
                    mirror.last_delta_id += deltas.len() as u64;
                    self.persist(&mirror).await;
                }
                self.consumers
                    .broadcast(ReplicaEvent::Deltas(deltas), None)
                    .await;
            }

            Envelope::Snapshot {
                entities,
                last_delta_id,
            } => {
                log::info!("Full resync from relay at position {last_delta_id}");
                {
                    let mut mirror = self.mirror.lock().await;
                    mirror.entities = entities.clone();
                    mirror.last_delta_id = last_delta_id;
                    self.persist(&mirror).await;
                }
                self.consumers
                    .broadcast(ReplicaEvent::State(entities), None)
                    .await;
            }

            Envelope::Pong => log::trace!("Heartbeat pong"),

            other => log::debug!("Unhandled envelope from relay: {other:?}"),
        }
    }

    /// Submit a locally created delta.
    ///
    /// Applied to the mirror immediately; sent now if connected, queued
    /// for the next connection otherwise.
    pub async fn submit(&self, delta: Delta) {
        self.submit_many(vec![delta], None).await;
    }

    /// Submit deltas originating from one local UI consumer.
    ///
    /// The originating consumer is excluded from the local fan-out — the
    /// same receive-and-rebroadcast shape the relay applies to sessions,
    /// scoped to one device.
    pub async fn submit_many(&self, deltas: Vec<Delta>, origin: Option<Uuid>) {
        if deltas.is_empty() {
            return;
        }

        let connected = *self.conn_state.read().await == ConnectionState::Connected;
        {
            let mut mirror = self.mirror.lock().await;
            merge::apply_all(&mut mirror.entities, &deltas);

            let mut sent = false;
            if connected {
                let tx = self.outgoing.read().await.clone();
                if let (Some(tx), Ok(text)) = (tx, Envelope::Delta(deltas.clone()).encode()) {
                    sent = tx.send(text).await.is_ok();
                }
            }
            if !sent {
                mirror.queue.extend(deltas.iter().cloned());
            }
            self.persist(&mirror).await;
        }

        self.consumers
            .broadcast(ReplicaEvent::Deltas(deltas), origin)
            .await;
    }

    /// Send the offline queue in submission order, then clear it.
    ///
    /// Flushing twice without new submissions in between sends nothing the
    /// second time.
    pub async fn flush_queue(&self) {
        let tx = match self.outgoing.read().await.clone() {
            Some(tx) => tx,
            None => return,
        };
        let mut mirror = self.mirror.lock().await;
        if mirror.queue.is_empty() {
            return;
        }
        let Ok(text) = Envelope::Delta(mirror.queue.clone()).encode() else {
            return;
        };
        if tx.send(text).await.is_ok() {
            log::info!("Replayed {} queued deltas", mirror.queue.len());
            mirror.queue.clear();
            self.persist(&mirror).await;
        }
    }

    /// Register a local UI consumer. It immediately receives the current
    /// connectivity status and a copy of the mirror.
    pub async fn attach_consumer(&self) -> (Uuid, mpsc::Receiver<ReplicaEvent>) {
        let (id, rx) = self.consumers.register().await;
        let connected = *self.conn_state.read().await == ConnectionState::Connected;
        self.consumers
            .send_to(&id, ReplicaEvent::Status { connected })
            .await;
        let entities = self.mirror.lock().await.entities.clone();
        self.consumers
            .send_to(&id, ReplicaEvent::State(entities))
            .await;
        (id, rx)
    }

    /// Remove a local UI consumer.
    pub async fn detach_consumer(&self, id: &Uuid) {
        self.consumers.remove(id).await;
    }

    /// Reset mirror, queue and sync position to empty and persist.
    pub async fn clear(&self) {
        {
            let mut mirror = self.mirror.lock().await;
            mirror.entities = EntityMap::new();
            mirror.queue.clear();
            mirror.last_delta_id = 0;
            self.persist(&mirror).await;
        }
        self.consumers
            .broadcast(ReplicaEvent::State(EntityMap::new()), None)
            .await;
    }

    async fn persist(&self, mirror: &Mirror) {
        if let Some(store) = &self.store {
            // State stays intact on failure; the next mutation retries
            if let Err(e) = store.save(&mirror.to_snapshot()).await {
                log::error!("Failed to persist replica state: {e}");
            }
        }
    }

    /// Current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.conn_state.read().await
    }

    /// Relay-issued client id, once assigned.
    pub async fn client_id(&self) -> Option<Uuid> {
        self.mirror.lock().await.client_id
    }

    /// Index of the next delta this replica expects.
    pub async fn last_delta_id(&self) -> u64 {
        self.mirror.lock().await.last_delta_id
    }

    /// Number of deltas waiting for the next connection.
    pub async fn queue_len(&self) -> usize {
        self.mirror.lock().await.queue.len()
    }

    /// Copy of the materialized mirror.
    pub async fn mirror(&self) -> EntityMap {
        self.mirror.lock().await.entities.clone()
    }

    /// The configured relay URL.
    pub fn relay_url(&self) -> &str {
        &self.config.relay_url
    }
}
