//! In-memory key-value store.

use super::{KeyValueStore, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// DashMap-backed store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_and_retrieve() {
        let store = MemoryStore::new();
        store.store("last_full_sync", b"123").await.unwrap();

        assert_eq!(
            store.retrieve("last_full_sync").await.unwrap(),
            Some(b"123".to_vec())
        );
        assert!(store.retrieve("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let store = MemoryStore::new();
        store.store("k", b"v").await.unwrap();
        store.remove("k").await.unwrap();
        store.remove("k").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn prefix_scan_is_sorted() {
        let store = MemoryStore::new();
        store.store("snapshot:course:b", b"2").await.unwrap();
        store.store("snapshot:course:a", b"1").await.unwrap();
        store.store("sync_record:course", b"x").await.unwrap();

        let keys = store.keys_with_prefix("snapshot:").await.unwrap();
        assert_eq!(keys, vec!["snapshot:course:a", "snapshot:course:b"]);
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.store("k", b"v").await.unwrap();
        assert_eq!(other.len(), 1);
    }
}
