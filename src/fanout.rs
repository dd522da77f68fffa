//! Fan-out table: id → sender map with sender-exclusion.
//!
//! The relay uses one of these as its connection table (clientId → session
//! handle) and the replica agent uses another, smaller one for the UI
//! consumers sharing a single device. Delivery is best-effort: a receiver
//! whose buffer is full drops the message — redelivery is the originating
//! replica's job via its own outbound queue, never this layer's.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct FanOutStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_receivers: usize,
}

/// Lock-free counters for the send path.
struct AtomicFanOutStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A fan-out table over any cloneable message type.
pub struct FanOut<T> {
    senders: Arc<RwLock<HashMap<Uuid, mpsc::Sender<T>>>>,
    /// Messages buffered per receiver before drops start
    capacity: usize,
    stats: Arc<AtomicFanOutStats>,
}

impl<T: Clone> FanOut<T> {
    /// Create a fan-out table with the given per-receiver buffer capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            senders: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            stats: Arc::new(AtomicFanOutStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Register a new receiver under a fresh id.
    pub async fn register(&self) -> (Uuid, mpsc::Receiver<T>) {
        let id = Uuid::new_v4();
        let rx = self.register_with_id(id).await;
        (id, rx)
    }

    /// Register a new receiver under a caller-chosen id.
    pub async fn register_with_id(&self, id: Uuid) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders.write().await.insert(id, tx);
        rx
    }

    /// Remove a receiver. Queued sends for it are simply dropped.
    pub async fn remove(&self, id: &Uuid) -> bool {
        self.senders.write().await.remove(id).is_some()
    }

    /// Send to every receiver except `exclude`. Returns the delivery count.
    pub async fn broadcast(&self, msg: T, exclude: Option<Uuid>) -> usize {
        let senders = self.senders.read().await;
        let mut delivered = 0;
        for (id, tx) in senders.iter() {
            if Some(*id) == exclude {
                continue;
            }
            // try_send so one slow receiver never stalls the others
            match tx.try_send(msg.clone()) {
                Ok(()) => {
                    delivered += 1;
                    self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Dropped fan-out message for receiver {id}");
                }
            }
        }
        delivered
    }

    /// Send to a single receiver.
    pub async fn send_to(&self, id: &Uuid, msg: T) -> bool {
        let senders = self.senders.read().await;
        match senders.get(id) {
            Some(tx) => {
                let sent = tx.try_send(msg).is_ok();
                if sent {
                    self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                }
                sent
            }
            None => false,
        }
    }

    /// Number of registered receivers.
    pub async fn count(&self) -> usize {
        self.senders.read().await.len()
    }

    /// Whether an id is registered.
    pub async fn contains(&self, id: &Uuid) -> bool {
        self.senders.read().await.contains_key(id)
    }

    /// Statistics snapshot.
    pub async fn stats(&self) -> FanOutStats {
        FanOutStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_receivers: self.senders.read().await.len(),
        }
    }

    /// Per-receiver buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
