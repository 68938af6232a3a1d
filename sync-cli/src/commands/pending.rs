//! List operations and sync bookkeeping persisted in a pending store.

use anyhow::{Context, Result};
use linkwise_sync_client::{PendingStore, SqliteStore, SyncRecord};
use linkwise_sync_types::{EntitySnapshot, EntityType, SyncOperation};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// What a pending store holds.
#[derive(Debug, Serialize)]
pub struct PendingReport {
    /// Namespace the engine last switched to.
    pub active_namespace: Option<String>,
    /// When the last full sync started (Unix millis).
    pub last_full_sync: Option<u64>,
    /// Unacknowledged operations, oldest first.
    pub operations: Vec<PendingEntry>,
    /// Last full-sync outcome per entity type.
    pub sync_records: Vec<SyncRecord>,
    /// Winning entity versions cached by conflict resolution.
    pub snapshots: Vec<SnapshotEntry>,
    /// Sequence marks per namespace.
    pub sequences: Vec<SequenceEntry>,
}

/// One cached entity version.
#[derive(Debug, Serialize)]
pub struct SnapshotEntry {
    /// `<type>:<id>` of the entity.
    pub entity: String,
    /// Progress metric, if the entity has one.
    pub progress: Option<u64>,
    /// Last update time (Unix millis).
    pub updated_at: u64,
    /// Payload size in bytes.
    pub payload_bytes: usize,
}

impl From<&EntitySnapshot> for SnapshotEntry {
    fn from(snapshot: &EntitySnapshot) -> Self {
        Self {
            entity: snapshot.key.to_string(),
            progress: snapshot.progress,
            updated_at: snapshot.updated_at,
            payload_bytes: snapshot.payload.len(),
        }
    }
}

/// Sequence bookkeeping for one namespace.
#[derive(Debug, Default, Serialize)]
pub struct SequenceEntry {
    /// Namespace.
    pub namespace: String,
    /// Last sequence assigned to an outbound envelope.
    pub outbound: u64,
    /// Highest sequence accepted from the host.
    pub inbound: u64,
}

/// One persisted operation.
#[derive(Debug, Serialize)]
pub struct PendingEntry {
    /// Operation id.
    pub id: String,
    /// `<type>:<id>` of the entity.
    pub entity: String,
    /// Delivery priority.
    pub priority: String,
    /// Namespace the operation is scoped to.
    pub namespace: String,
    /// Retries so far.
    pub retry_count: u32,
    /// Payload size in bytes.
    pub payload_bytes: usize,
    /// Creation time (Unix millis).
    pub created_at: u64,
}

impl From<&SyncOperation> for PendingEntry {
    fn from(op: &SyncOperation) -> Self {
        Self {
            id: op.id.to_string(),
            entity: op.entity.to_string(),
            priority: op.priority.to_string(),
            namespace: op.namespace.to_string(),
            retry_count: op.retry_count,
            payload_bytes: op.payload.len(),
            created_at: op.created_at,
        }
    }
}

/// Read everything the engine persisted in the database at `db`.
pub async fn inspect(db: &Path) -> Result<PendingReport> {
    let sqlite = SqliteStore::open(db)
        .await
        .with_context(|| format!("Failed to open pending store {}", db.display()))?;
    let mut pending = PendingStore::new(Arc::new(sqlite.clone()));

    let operations = pending.load().await.context("Failed to load pending operations")?;
    let active_namespace = pending.active_namespace().await?.map(|ns| ns.to_string());
    let last_full_sync = pending.last_full_sync().await?;

    let mut sync_records = Vec::new();
    let mut snapshots = Vec::new();
    for entity_type in EntityType::ALL {
        if let Some(record) = pending.sync_record(entity_type).await? {
            sync_records.push(record);
        }
        for snapshot in pending.cached_snapshots(entity_type).await? {
            snapshots.push(SnapshotEntry::from(&snapshot));
        }
    }

    let mut marks: BTreeMap<String, SequenceEntry> = BTreeMap::new();
    for (namespace, sequence) in pending.load_sequences().await? {
        marks.entry(namespace.to_string()).or_default().outbound = sequence.value();
    }
    for (namespace, sequence) in pending.load_inbound_sequences().await? {
        marks.entry(namespace.to_string()).or_default().inbound = sequence.value();
    }
    let sequences = marks
        .into_iter()
        .map(|(namespace, entry)| SequenceEntry { namespace, ..entry })
        .collect();

    sqlite.close().await;

    Ok(PendingReport {
        active_namespace,
        last_full_sync,
        operations: operations.iter().map(PendingEntry::from).collect(),
        sync_records,
        snapshots,
        sequences,
    })
}

/// Run the pending command.
pub async fn run(db: &Path, json: bool) -> Result<()> {
    if !db.exists() {
        println!("No pending store at {}", db.display());
        return Ok(());
    }

    let report = inspect(db).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("=== sync-sim pending ===");
    println!();
    println!(
        "Namespace: {}",
        report.active_namespace.as_deref().unwrap_or("(default)")
    );
    match report.last_full_sync {
        Some(at) => println!("Last full sync: {at} (unix ms)"),
        None => println!("Last full sync: never"),
    }
    println!();

    if report.operations.is_empty() {
        println!("Pending: none");
    } else {
        println!("Pending ({}):", report.operations.len());
        for op in &report.operations {
            println!(
                "  {} {:<8} {:<28} retries {} ({} bytes, ns {})",
                &op.id[..8.min(op.id.len())],
                op.priority,
                op.entity,
                op.retry_count,
                op.payload_bytes,
                op.namespace
            );
        }
    }

    if !report.sequences.is_empty() {
        println!();
        println!("Sequences:");
        for entry in &report.sequences {
            println!(
                "  {:<20} out {:<6} in {}",
                entry.namespace, entry.outbound, entry.inbound
            );
        }
    }

    if !report.snapshots.is_empty() {
        println!();
        println!("Cached snapshots ({}):", report.snapshots.len());
        for snapshot in &report.snapshots {
            let progress = snapshot
                .progress
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".into());
            println!(
                "  {:<28} progress {:<4} ({} bytes)",
                snapshot.entity, progress, snapshot.payload_bytes
            );
        }
    }

    if !report.sync_records.is_empty() {
        println!();
        println!("Full sync:");
        for record in &report.sync_records {
            match &record.error {
                None => println!(
                    "  {:<14} ok ({} delivered)",
                    record.entity_type.to_string(),
                    record.delivered
                ),
                Some(error) => println!(
                    "  {:<14} FAILED: {}",
                    record.entity_type.to_string(),
                    error
                ),
            }
        }
    }

    Ok(())
}
