//! JSON wire protocol for delta synchronization.
//!
//! Every frame is an envelope `{"type": ..., "data": ...}`:
//! ```text
//! ┌───────────┬───────────────┬─────────────────────────────┐
//! │ type      │ direction     │ data                        │
//! ├───────────┼───────────────┼─────────────────────────────┤
//! │ connected │ relay→client  │ {clientId}                  │
//! │ ping/pong │ client↔relay  │ —                           │
//! │ sync      │ client→relay  │ {lastDeltaId}               │
//! │ delta     │ either        │ [Delta, ...]                │
//! │ snapshot  │ relay→client  │ {entities, lastDeltaId}     │
//! └───────────┴───────────────┴─────────────────────────────┘
//! ```
//!
//! Deltas carry a `strategy` tag on the wire but are classified into a
//! closed set of [`DeltaPayload`] variants before they touch state, so the
//! merge engine is an exhaustive match rather than string comparison.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::merge::EntityMap;

/// Merge strategy tag carried by every delta.
///
/// `Unknown` absorbs strategies this build does not recognize; such deltas
/// are kept in the log for forward compatibility but never touch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Last-write-wins: the most recently applied delta for a record id
    /// replaces the record wholesale.
    Lww,
    /// Monotonic counter: increments a named sub-counter on a parent record.
    Counter,
    #[serde(other)]
    Unknown,
}

/// The atomic unit of change. Immutable once created; deltas form the
/// append-only log whose arrival order at the relay is canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub strategy: Strategy,
    /// Logical table name. For counter deltas this names the parent entity.
    pub entity: String,
    /// Opaque payload; validation is the business layer's job.
    pub record: Value,
}

/// Classified delta payload — what the merge engine actually dispatches on.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaPayload<'a> {
    /// Replace `state[entity][id]` with `record`.
    LwwUpsert {
        entity: &'a str,
        id: &'a str,
        record: &'a Value,
    },
    /// Increment `state[entity][parent_id].counters[key]` by one.
    CounterIncrement {
        entity: &'a str,
        parent_id: &'a str,
        key: &'a str,
    },
    /// Unrecognized shape; logged and absorbed as a no-op.
    Unknown,
}

impl Delta {
    /// Create a delta from already-validated business-layer input.
    pub fn new(strategy: Strategy, entity: impl Into<String>, record: Value) -> Self {
        Self {
            strategy,
            entity: entity.into(),
            record,
        }
    }

    /// Create a last-write-wins upsert delta.
    pub fn lww(entity: impl Into<String>, record: Value) -> Self {
        Self::new(Strategy::Lww, entity, record)
    }

    /// Create a counter increment against a parent record.
    pub fn counter(
        entity: impl Into<String>,
        parent_id: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self::new(
            Strategy::Counter,
            entity,
            serde_json::json!({ "parentId": parent_id.into(), "key": key.into() }),
        )
    }

    /// Classify this delta into a payload variant.
    ///
    /// A delta whose record is missing the fields its strategy needs
    /// classifies as `Unknown` — it stays in the log but has no effect.
    pub fn payload(&self) -> DeltaPayload<'_> {
        match self.strategy {
            Strategy::Lww => match self.record.get("id").and_then(Value::as_str) {
                Some(id) => DeltaPayload::LwwUpsert {
                    entity: &self.entity,
                    id,
                    record: &self.record,
                },
                None => DeltaPayload::Unknown,
            },
            Strategy::Counter => {
                // Older producers used messageId/reaction for these fields
                let parent_id = self
                    .record
                    .get("parentId")
                    .or_else(|| self.record.get("messageId"))
                    .and_then(Value::as_str);
                let key = self
                    .record
                    .get("key")
                    .or_else(|| self.record.get("reaction"))
                    .and_then(Value::as_str);
                match (parent_id, key) {
                    (Some(parent_id), Some(key)) => DeltaPayload::CounterIncrement {
                        entity: &self.entity,
                        parent_id,
                        key,
                    },
                    _ => DeltaPayload::Unknown,
                }
            }
            Strategy::Unknown => DeltaPayload::Unknown,
        }
    }
}

/// Top-level protocol envelope.
///
/// Serialized as JSON with an adjacent `type`/`data` tagging so the wire
/// frames read exactly like the table in the module docs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Envelope {
    /// Issued once per new connection with a freshly generated identity.
    Connected {
        #[serde(rename = "clientId")]
        client_id: Uuid,
    },
    /// Liveness check.
    Ping,
    /// Reply to ping.
    Pong,
    /// Catch-up request: "send me everything after this index".
    Sync {
        #[serde(rename = "lastDeltaId")]
        last_delta_id: u64,
    },
    /// One or more deltas to apply/broadcast.
    Delta(Vec<Delta>),
    /// Full-state resync for replicas whose position predates the
    /// relay's retention horizon.
    Snapshot {
        entities: EntityMap,
        #[serde(rename = "lastDeltaId")]
        last_delta_id: u64,
    },
}

impl Envelope {
    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the JSON wire format.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
