//! Persistence collaborator for Linkwise.
//!
//! A minimal async key-value interface. The pending store, the last-full-sync
//! timestamp and cached remote snapshots all live behind it.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use linkwise_sync_types::SyncError;

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored bytes could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: std::path::PathBuf,
    },
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

/// Trait for key-value storage backends.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store bytes under a key, replacing any previous value.
    async fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Fetch the bytes under a key.
    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// All keys starting with `prefix`, sorted.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}
