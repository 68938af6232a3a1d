//! Entity snapshots - versions of one logical entity used for reconciliation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{EntityKey, Namespace, SequenceNumber, SyncOperation};

/// One side's version of a logical entity.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// The entity this snapshot describes.
    pub key: EntityKey,
    /// Progress metric (higher stage/step wins), if the entity has one.
    pub progress: Option<u64>,
    /// Last update time (Unix millis).
    pub updated_at: u64,
    /// Encoded entity state.
    pub payload: Vec<u8>,
}

impl EntitySnapshot {
    /// Create a snapshot.
    pub fn new(key: EntityKey, progress: Option<u64>, updated_at: u64, payload: Vec<u8>) -> Self {
        Self {
            key,
            progress,
            updated_at,
            payload,
        }
    }
}

impl From<&SyncOperation> for EntitySnapshot {
    fn from(op: &SyncOperation) -> Self {
        Self {
            key: op.entity.clone(),
            progress: op.progress,
            updated_at: op.created_at,
            payload: op.payload.clone(),
        }
    }
}

impl fmt::Debug for EntitySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitySnapshot")
            .field("key", &self.key)
            .field("progress", &self.progress)
            .field("updated_at", &self.updated_at)
            .field(
                "payload",
                &format!("[{} bytes REDACTED]", self.payload.len()),
            )
            .finish()
    }
}

/// An inbound update pushed by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUpdate {
    /// Namespace the host sent it under.
    pub namespace: Namespace,
    /// Host-assigned sequence for stale detection.
    pub sequence: SequenceNumber,
    /// The host's version of the entity.
    pub snapshot: EntitySnapshot,
}
