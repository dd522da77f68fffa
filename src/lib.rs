//! # deltasync — offline-first multi-device synchronization
//!
//! Independent replicas each hold a local copy of a small relational
//! dataset and converge by exchanging an append-only log of deltas through
//! a central relay. The relay has no authority over content — it is a
//! durable, ordered broadcast point — so every copy applies the same merge
//! rules (last-write-wins per record, monotonic counters) and reaches the
//! same state regardless of arrival order or network interruption.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ ReplicaAgent │ ◄────────────────► │ RelayServer  │
//! │ (per device) │   JSON envelopes   │ (central)    │
//! └──────┬───────┘                    └──────┬───────┘
//!        │ mirror + offline queue            │ canonical log + state
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ FanOut       │                    │ FanOut       │
//! │ (UI tabs)    │                    │ (sessions)   │
//! └──────────────┘                    └──────┬───────┘
//!                                            │
//!                                     ┌──────┴───────┐
//!                                     │ SnapshotStore│
//!                                     │ (JSON file)  │
//!                                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire envelopes and delta classification
//! - [`merge`] — the pure delta-fold merge engine
//! - [`fanout`] — id → sender broadcast table, shared by both sides
//! - [`store`] — whole-snapshot file persistence
//! - [`relay`] — the sync authority: ordering, persistence, re-broadcast
//! - [`replica`] — device-side agent: mirror, offline queue, reconnect

pub mod protocol;
pub mod merge;
pub mod fanout;
pub mod store;
pub mod relay;
pub mod replica;

// Re-exports for convenience
pub use protocol::{Delta, DeltaPayload, Envelope, ProtocolError, Strategy};
pub use merge::{apply, apply_all, EntityMap};
pub use fanout::{FanOut, FanOutStats};
pub use store::{RelaySnapshot, ReplicaSnapshot, SnapshotStore, StoreError};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use replica::{ConnectionState, ReplicaAgent, ReplicaConfig, ReplicaEvent};
