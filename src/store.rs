//! Whole-snapshot persistence for relay and replica state.
//!
//! Both sides keep one JSON file: the relay persists `{entities,
//! firstDeltaId, deltas}`, the replica persists `{clientId, lastDeltaId,
//! queue, entities}`. Every mutation rewrites the whole file — acceptable
//! at this scale, and the retention limit on the relay bounds the log
//! (see [`crate::relay::RelayConfig::retention`]).
//!
//! A missing or corrupt file loads as the default snapshot, which is
//! persisted immediately so subsequent loads succeed.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::merge::EntityMap;
use crate::protocol::Delta;

/// Persisted relay state: materialized entities plus the retained log tail.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelaySnapshot {
    pub entities: EntityMap,
    /// Canonical index of `deltas[0]`; nonzero once retention has trimmed
    /// the log prefix.
    #[serde(rename = "firstDeltaId", default)]
    pub first_delta_id: u64,
    pub deltas: Vec<Delta>,
}

/// Persisted replica state: identity, sync position, unsent queue, mirror.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    #[serde(rename = "clientId", default)]
    pub client_id: Option<Uuid>,
    #[serde(rename = "lastDeltaId", default)]
    pub last_delta_id: u64,
    #[serde(default)]
    pub queue: Vec<Delta>,
    #[serde(default)]
    pub entities: EntityMap,
}

/// A single-file JSON snapshot store.
pub struct SnapshotStore<T> {
    path: PathBuf,
    _snapshot: PhantomData<T>,
}

impl<T> SnapshotStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Create a store backed by the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _snapshot: PhantomData,
        }
    }

    /// Load the snapshot, initializing an empty one on first run or after
    /// corruption so the next load succeeds.
    pub async fn load(&self) -> Result<T, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(snapshot) => Ok(snapshot),
                Err(e) => {
                    log::warn!(
                        "Corrupt snapshot at {}: {e}; starting empty",
                        self.path.display()
                    );
                    let fresh = T::default();
                    self.save(&fresh).await?;
                    Ok(fresh)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let fresh = T::default();
                self.save(&fresh).await?;
                Ok(fresh)
            }
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    /// Persist the snapshot, replacing the previous file contents.
    pub async fn save(&self, snapshot: &T) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let text =
            serde_json::to_string(snapshot).map_err(|e| StoreError::Serialization(e.to_string()))?;
        tokio::fs::write(&self.path, text)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Store errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    Io(String),
    Serialization(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "Store I/O error: {e}"),
            Self::Serialization(e) => write!(f, "Store serialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
