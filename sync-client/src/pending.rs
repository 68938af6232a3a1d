//! Durable record of unacknowledged operations.
//!
//! Layout in the key-value store:
//!
//! | Key                       | Value                                   |
//! |---------------------------|-----------------------------------------|
//! | `pending_operations`      | MessagePack `Vec<SyncOperation>`        |
//! | `last_full_sync`          | MessagePack Unix millis                 |
//! | `sync_record:<entity>`    | MessagePack [`SyncRecord`]              |
//! | `snapshot:<entity>:<id>`  | MessagePack [`EntitySnapshot`]          |
//! | `sequence:<namespace>`    | MessagePack last outbound sequence      |
//! | `inbound_sequence:<ns>`   | MessagePack highest inbound sequence    |
//! | `active_namespace`        | MessagePack [`Namespace`]               |
//!
//! The whole pending list is rewritten on every change. It is small (bounded
//! by the queue capacity plus in-flight) and this keeps restarts trivial.

use std::collections::HashMap;
use std::sync::Arc;

use linkwise_sync_types::{
    EntityKey, EntitySnapshot, EntityType, Namespace, OperationId, SequenceNumber, SyncError,
    SyncOperation,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::store::KeyValueStore;

const PENDING_KEY: &str = "pending_operations";
const LAST_FULL_SYNC_KEY: &str = "last_full_sync";
const SYNC_RECORD_PREFIX: &str = "sync_record:";
const SNAPSHOT_PREFIX: &str = "snapshot:";
const SEQUENCE_PREFIX: &str = "sequence:";
const INBOUND_SEQUENCE_PREFIX: &str = "inbound_sequence:";
const ACTIVE_NAMESPACE_KEY: &str = "active_namespace";

/// Outcome of one entity sync within a full sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// The entity type synced.
    pub entity_type: EntityType,
    /// When the sub-sync finished (Unix millis).
    pub completed_at: u64,
    /// Number of entities delivered.
    pub delivered: usize,
    /// Failure message, if the sub-sync failed.
    pub error: Option<String>,
}

impl SyncRecord {
    /// Whether the sub-sync succeeded.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Durable pending-operation list plus sync bookkeeping.
pub struct PendingStore {
    store: Arc<dyn KeyValueStore>,
    operations: HashMap<OperationId, SyncOperation>,
}

impl PendingStore {
    /// Wrap a key-value store. Call [`PendingStore::load`] before use.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            operations: HashMap::new(),
        }
    }

    /// Load persisted operations, oldest first.
    pub async fn load(&mut self) -> Result<Vec<SyncOperation>, SyncError> {
        let operations: Vec<SyncOperation> = self.get(PENDING_KEY).await?.unwrap_or_default();
        self.operations = operations
            .iter()
            .map(|op| (op.id, op.clone()))
            .collect();
        Ok(self.snapshot_list())
    }

    /// Persist a new operation.
    pub async fn record(&mut self, operation: &SyncOperation) -> Result<(), SyncError> {
        self.operations.insert(operation.id, operation.clone());
        self.flush().await
    }

    /// Persist a changed operation (e.g. bumped retry count).
    pub async fn update(&mut self, operation: &SyncOperation) -> Result<(), SyncError> {
        self.record(operation).await
    }

    /// Forget an operation (acked, exhausted or cancelled).
    pub async fn remove(&mut self, id: &OperationId) -> Result<Option<SyncOperation>, SyncError> {
        let removed = self.operations.remove(id);
        if removed.is_some() {
            self.flush().await?;
        }
        Ok(removed)
    }

    /// Forget every operation scoped to a namespace.
    pub async fn purge_namespace(
        &mut self,
        namespace: &Namespace,
    ) -> Result<Vec<SyncOperation>, SyncError> {
        let ids: Vec<OperationId> = self
            .operations
            .values()
            .filter(|op| &op.namespace == namespace)
            .map(|op| op.id)
            .collect();
        let purged: Vec<SyncOperation> = ids
            .iter()
            .filter_map(|id| self.operations.remove(id))
            .collect();
        if !purged.is_empty() {
            self.flush().await?;
        }
        Ok(purged)
    }

    /// Whether an operation is recorded.
    pub fn contains(&self, id: &OperationId) -> bool {
        self.operations.contains_key(id)
    }

    /// Number of recorded operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Recorded operations, oldest first.
    pub fn operations(&self) -> Vec<SyncOperation> {
        self.snapshot_list()
    }

    /// When the last full sync started (Unix millis).
    pub async fn last_full_sync(&self) -> Result<Option<u64>, SyncError> {
        self.get(LAST_FULL_SYNC_KEY).await
    }

    /// Record the start of a full sync.
    pub async fn set_last_full_sync(&self, at_millis: u64) -> Result<(), SyncError> {
        self.put(LAST_FULL_SYNC_KEY, &at_millis).await
    }

    /// Persist the outcome of one entity sync.
    pub async fn record_sync(&self, record: &SyncRecord) -> Result<(), SyncError> {
        let key = format!("{SYNC_RECORD_PREFIX}{}", record.entity_type);
        self.put(&key, record).await
    }

    /// Last persisted outcome for an entity type.
    pub async fn sync_record(&self, entity_type: EntityType) -> Result<Option<SyncRecord>, SyncError> {
        self.get(&format!("{SYNC_RECORD_PREFIX}{entity_type}")).await
    }

    /// Cache the winning version of an entity.
    pub async fn cache_snapshot(&self, snapshot: &EntitySnapshot) -> Result<(), SyncError> {
        self.put(&snapshot_key(&snapshot.key), snapshot).await
    }

    /// Cached version of an entity.
    pub async fn cached_snapshot(&self, key: &EntityKey) -> Result<Option<EntitySnapshot>, SyncError> {
        self.get(&snapshot_key(key)).await
    }

    /// Every cached snapshot of an entity type, ordered by id.
    pub async fn cached_snapshots(
        &self,
        entity_type: EntityType,
    ) -> Result<Vec<EntitySnapshot>, SyncError> {
        let prefix = format!("{SNAPSHOT_PREFIX}{entity_type}:");
        let keys = self.store.keys_with_prefix(&prefix).await?;
        let mut snapshots = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(snapshot) = self.get(&key).await? {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    /// Persist the last outbound sequence of a namespace.
    pub async fn store_sequence(
        &self,
        namespace: &Namespace,
        sequence: SequenceNumber,
    ) -> Result<(), SyncError> {
        self.put(&format!("{SEQUENCE_PREFIX}{namespace}"), &sequence).await
    }

    /// Every persisted outbound sequence.
    pub async fn load_sequences(&self) -> Result<Vec<(Namespace, SequenceNumber)>, SyncError> {
        self.load_sequences_under(SEQUENCE_PREFIX).await
    }

    /// Persist the highest inbound sequence accepted in a namespace.
    pub async fn store_inbound_sequence(
        &self,
        namespace: &Namespace,
        sequence: SequenceNumber,
    ) -> Result<(), SyncError> {
        self.put(&format!("{INBOUND_SEQUENCE_PREFIX}{namespace}"), &sequence)
            .await
    }

    /// Every persisted inbound high-water mark.
    pub async fn load_inbound_sequences(
        &self,
    ) -> Result<Vec<(Namespace, SequenceNumber)>, SyncError> {
        self.load_sequences_under(INBOUND_SEQUENCE_PREFIX).await
    }

    /// Namespace that was active when the engine last switched.
    pub async fn active_namespace(&self) -> Result<Option<Namespace>, SyncError> {
        self.get(ACTIVE_NAMESPACE_KEY).await
    }

    /// Persist the active namespace.
    pub async fn set_active_namespace(&self, namespace: &Namespace) -> Result<(), SyncError> {
        self.put(ACTIVE_NAMESPACE_KEY, namespace).await
    }

    async fn load_sequences_under(
        &self,
        prefix: &str,
    ) -> Result<Vec<(Namespace, SequenceNumber)>, SyncError> {
        let keys = self.store.keys_with_prefix(prefix).await?;
        let mut sequences = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(sequence) = self.get::<SequenceNumber>(&key).await? {
                sequences.push((Namespace::new(&key[prefix.len()..]), sequence));
            }
        }
        Ok(sequences)
    }

    async fn flush(&self) -> Result<(), SyncError> {
        self.put(PENDING_KEY, &self.snapshot_list()).await
    }

    fn snapshot_list(&self) -> Vec<SyncOperation> {
        let mut list: Vec<SyncOperation> = self.operations.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        list
    }

    async fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), SyncError> {
        let bytes = rmp_serde::to_vec(value).map_err(SyncError::Serialization)?;
        self.store.store(key, &bytes).await?;
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, SyncError> {
        match self.store.retrieve(key).await? {
            Some(bytes) => rmp_serde::from_slice(&bytes)
                .map(Some)
                .map_err(SyncError::Deserialization),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for PendingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingStore")
            .field("operations", &self.operations.len())
            .finish()
    }
}

fn snapshot_key(key: &EntityKey) -> String {
    format!("{SNAPSHOT_PREFIX}{}:{}", key.entity_type, key.entity_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use linkwise_sync_types::Priority;

    fn op(entity_id: &str, created_at: u64) -> SyncOperation {
        SyncOperation::new(
            EntityKey::new(EntityType::Scorecard, entity_id),
            Priority::Normal,
            vec![7; 8],
            Namespace::default(),
        )
        .with_created_at(created_at)
    }

    async fn pending() -> (PendingStore, MemoryStore) {
        let store = MemoryStore::new();
        let mut pending = PendingStore::new(Arc::new(store.clone()));
        pending.load().await.unwrap();
        (pending, store)
    }

    // ===========================================
    // Pending operations
    // ===========================================

    #[tokio::test]
    async fn operations_survive_reload() {
        let (mut pending, store) = pending().await;
        let first = op("a", 10);
        let second = op("b", 20);
        pending.record(&second).await.unwrap();
        pending.record(&first).await.unwrap();

        let mut reopened = PendingStore::new(Arc::new(store));
        let loaded = reopened.load().await.unwrap();
        assert_eq!(loaded, vec![first, second]);
        assert_eq!(reopened.len(), 2);
    }

    #[tokio::test]
    async fn update_replaces_retry_count() {
        let (mut pending, store) = pending().await;
        let mut operation = op("a", 10);
        pending.record(&operation).await.unwrap();
        operation.retry_count = 2;
        pending.update(&operation).await.unwrap();

        let mut reopened = PendingStore::new(Arc::new(store));
        let loaded = reopened.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].retry_count, 2);
    }

    #[tokio::test]
    async fn remove_forgets_operation() {
        let (mut pending, _) = pending().await;
        let operation = op("a", 10);
        pending.record(&operation).await.unwrap();

        assert!(pending.remove(&operation.id).await.unwrap().is_some());
        assert!(pending.remove(&operation.id).await.unwrap().is_none());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn purge_namespace_only_touches_that_namespace() {
        let (mut pending, _) = pending().await;
        let mut scoped = op("a", 10);
        scoped.namespace = Namespace::new("old");
        let kept = op("b", 20);
        pending.record(&scoped).await.unwrap();
        pending.record(&kept).await.unwrap();

        let purged = pending.purge_namespace(&Namespace::new("old")).await.unwrap();
        assert_eq!(purged.len(), 1);
        assert!(pending.contains(&kept.id));
        assert!(!pending.contains(&scoped.id));
    }

    #[tokio::test]
    async fn corrupt_pending_list_is_an_error() {
        let store = MemoryStore::new();
        store.store(PENDING_KEY, &[0xC1]).await.unwrap();

        let mut pending = PendingStore::new(Arc::new(store));
        assert!(matches!(
            pending.load().await,
            Err(SyncError::Deserialization(_))
        ));
    }

    // ===========================================
    // Sync bookkeeping
    // ===========================================

    #[tokio::test]
    async fn last_full_sync_roundtrip() {
        let (pending, _) = pending().await;
        assert!(pending.last_full_sync().await.unwrap().is_none());

        pending.set_last_full_sync(1_700_000_000_000).await.unwrap();
        assert_eq!(
            pending.last_full_sync().await.unwrap(),
            Some(1_700_000_000_000)
        );
    }

    #[tokio::test]
    async fn sync_records_are_per_entity_type() {
        let (pending, _) = pending().await;
        let record = SyncRecord {
            entity_type: EntityType::Course,
            completed_at: 5,
            delivered: 0,
            error: Some("host unreachable".into()),
        };
        pending.record_sync(&record).await.unwrap();

        assert_eq!(
            pending.sync_record(EntityType::Course).await.unwrap(),
            Some(record.clone())
        );
        assert!(!record.succeeded());
        assert!(pending
            .sync_record(EntityType::Scorecard)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn snapshots_are_cached_by_key() {
        let (pending, store) = pending().await;
        let a = EntitySnapshot::new(EntityKey::new(EntityType::Course, "a"), None, 1, vec![1]);
        let b = EntitySnapshot::new(EntityKey::new(EntityType::Course, "b"), None, 2, vec![2]);
        pending.cache_snapshot(&b).await.unwrap();
        pending.cache_snapshot(&a).await.unwrap();

        assert!(store.retrieve("snapshot:course:a").await.unwrap().is_some());
        assert_eq!(pending.cached_snapshot(&a.key).await.unwrap(), Some(a.clone()));
        assert_eq!(
            pending.cached_snapshots(EntityType::Course).await.unwrap(),
            vec![a, b]
        );
    }

    #[tokio::test]
    async fn sequences_roundtrip() {
        let (pending, _) = pending().await;
        pending
            .store_sequence(&Namespace::new("watch"), SequenceNumber::new(9))
            .await
            .unwrap();

        let sequences = pending.load_sequences().await.unwrap();
        assert_eq!(
            sequences,
            vec![(Namespace::new("watch"), SequenceNumber::new(9))]
        );
        assert!(pending.load_inbound_sequences().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inbound_marks_are_kept_apart_from_outbound() {
        let (pending, store) = pending().await;
        pending
            .store_sequence(&Namespace::new("watch"), SequenceNumber::new(2))
            .await
            .unwrap();
        pending
            .store_inbound_sequence(&Namespace::new("watch"), SequenceNumber::new(5))
            .await
            .unwrap();

        assert!(store
            .retrieve("inbound_sequence:watch")
            .await
            .unwrap()
            .is_some());
        assert_eq!(
            pending.load_inbound_sequences().await.unwrap(),
            vec![(Namespace::new("watch"), SequenceNumber::new(5))]
        );
        assert_eq!(
            pending.load_sequences().await.unwrap(),
            vec![(Namespace::new("watch"), SequenceNumber::new(2))]
        );
    }
}
