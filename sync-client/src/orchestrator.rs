//! Sync orchestrator - the public submission API and the drain loop.
//!
//! [`SyncOrchestrator`] is a cheap, clonable handle. Every piece of mutable
//! sync state (queue, delivery tracker, pending store, sequence counters)
//! is owned by a single actor task; handles talk to it over a channel, so
//! concurrent producers are serialized through one entry point.
//!
//! The actor loop:
//! 1. refreshes the link state from the transport's reachability signal,
//! 2. drains the queue up to `max_in_flight`, honouring the power level and
//!    the link's critical-only rule,
//! 3. waits for the next command, send result, ack deadline, retry, backoff
//!    expiry or power change.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use linkwise_sync_core::link::calculate_backoff;
use linkwise_sync_core::queue::eligibility_floor;
use linkwise_sync_core::{
    resolve_conflict, AckedDelivery, ConnectionQuality, ContextDeduper, DeliveryTracker,
    EnqueueOutcome, FailureDecision, LatencyWindow, LinkAction, LinkEvent, LinkState,
    PayloadCompressor, PriorityQueue, Resolution, ResolutionRule, SequenceTracker, Side,
};
use linkwise_sync_types::{
    unix_millis, Ack, EntityKey, EntitySnapshot, EntityType, EnvelopeId, MessageEnvelope,
    Namespace, OperationId, OptimizationLevel, PowerProfile, PowerSignal, Priority, RemoteUpdate,
    SyncError, SyncOperation,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

use crate::config::SyncConfig;
use crate::events::{ObserverRegistry, SyncEvent};
use crate::handle::{DeliveryOutcome, OutcomeSender, SubmissionHandle};
use crate::pending::{PendingStore, SyncRecord};
use crate::power::PowerMonitor;
use crate::store::KeyValueStore;
use crate::transport::{BlobMetadata, Transport, TransportError};

/// Order in which a full sync visits entity types.
pub const FULL_SYNC_ORDER: [EntityType; 3] = [
    EntityType::Course,
    EntityType::ActiveRound,
    EntityType::Scorecard,
];

const COMMAND_BUFFER: usize = 64;
const REACHABILITY_POLL: Duration = Duration::from_secs(1);
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Supplies the current local state of each entity type for a full sync.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Every entity of this type that should be pushed.
    async fn snapshots(&self, entity_type: EntityType) -> Result<Vec<EntitySnapshot>, SyncError>;
}

/// Result of [`SyncOrchestrator::sync_all`].
///
/// Sub-syncs are independent; every record is persisted even when another
/// one failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullSyncReport {
    /// One record per entity type, in [`FULL_SYNC_ORDER`].
    pub records: Vec<SyncRecord>,
}

impl FullSyncReport {
    /// Whether every sub-sync succeeded.
    pub fn succeeded(&self) -> bool {
        self.records.iter().all(SyncRecord::succeeded)
    }

    /// The sub-syncs that failed.
    pub fn failures(&self) -> impl Iterator<Item = &SyncRecord> {
        self.records.iter().filter(|record| !record.succeeded())
    }
}

/// Result of pushing a full-state application context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextOutcome {
    /// The context went to the transport.
    Sent {
        /// Queued operations dropped because the context supersedes them.
        superseded: usize,
    },
    /// Byte-identical to the last context sent for this namespace.
    Suppressed,
}

/// Result of applying a host-pushed update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// The update was reconciled and the winner cached.
    Applied {
        /// Which version won.
        winner: Side,
        /// The deciding rule, when there was a local version to compare.
        rule: Option<ResolutionRule>,
    },
    /// Sequence at or below one already seen; dropped.
    Stale,
    /// Addressed to a namespace that is not active; dropped.
    ForeignNamespace,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    /// Active namespace.
    pub namespace: Namespace,
    /// Operations waiting in the queue.
    pub queued: usize,
    /// Envelopes awaiting ack.
    pub in_flight: usize,
    /// Operations waiting out a retry delay.
    pub awaiting_retry: usize,
    /// Operations recorded in the pending store.
    pub pending: usize,
    /// Link state.
    pub link: LinkState,
    /// Connection quality.
    pub quality: ConnectionQuality,
    /// Power level the drain loop is honouring.
    pub level: OptimizationLevel,
}

enum Command {
    Submit {
        operation: SyncOperation,
        outcome: OutcomeSender,
    },
    SubmitContext {
        context: Vec<u8>,
        reply: oneshot::Sender<Result<ContextOutcome, SyncError>>,
    },
    ReceiveRemote {
        update: RemoteUpdate,
        reply: oneshot::Sender<Result<RemoteOutcome, SyncError>>,
    },
    SwitchNamespace {
        namespace: Namespace,
        reply: oneshot::Sender<Result<usize, SyncError>>,
    },
    Cancel {
        operation_id: OperationId,
        reply: oneshot::Sender<Result<bool, SyncError>>,
    },
    BeginFullSync {
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    RecordSync {
        record: SyncRecord,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    CachedSnapshot {
        key: EntityKey,
        reply: oneshot::Sender<Result<Option<EntitySnapshot>, SyncError>>,
    },
    TransferBlob {
        data: Vec<u8>,
        metadata: BlobMetadata,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Status {
        reply: oneshot::Sender<SyncStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct SendResult {
    operation_id: OperationId,
    envelope_id: EnvelopeId,
    result: Result<Ack, TransportError>,
}

/// Handle to a running sync engine.
#[derive(Debug, Clone)]
pub struct SyncOrchestrator {
    commands: mpsc::Sender<Command>,
    observers: ObserverRegistry,
    power: PowerMonitor,
}

impl SyncOrchestrator {
    /// Restore persisted state and start the drain loop.
    ///
    /// Operations left in the pending store by a previous run are
    /// re-enqueued before the first drain.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is inconsistent or the pending
    /// store cannot be read.
    pub async fn start<T: Transport + 'static>(
        config: SyncConfig,
        transport: Arc<T>,
        store: Arc<dyn KeyValueStore>,
        power: PowerMonitor,
        observers: ObserverRegistry,
    ) -> Result<Self, SyncError> {
        config
            .validate()
            .map_err(|e| SyncError::InvalidData(e.to_string()))?;

        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let mut engine = Engine::new(
            config,
            transport,
            PendingStore::new(store),
            power.subscribe(),
            observers.clone(),
            results_tx,
        );
        engine.restore().await?;

        let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(engine.run(commands_rx, results_rx));

        Ok(Self {
            commands,
            observers,
            power,
        })
    }

    /// Observer registry events are published to.
    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    /// Power monitor feeding the drain loop.
    pub fn power(&self) -> &PowerMonitor {
        &self.power
    }

    /// Submit a payload for delivery.
    pub async fn submit(
        &self,
        entity: EntityKey,
        payload: Vec<u8>,
        priority: Priority,
    ) -> Result<SubmissionHandle, SyncError> {
        let operation = SyncOperation::new(entity, priority, payload, Namespace::default());
        self.submit_operation(operation).await
    }

    /// Submit a payload that carries a progress metric for conflict
    /// resolution.
    pub async fn submit_with_progress(
        &self,
        entity: EntityKey,
        payload: Vec<u8>,
        priority: Priority,
        progress: u64,
    ) -> Result<SubmissionHandle, SyncError> {
        let operation = SyncOperation::new(entity, priority, payload, Namespace::default())
            .with_progress(progress);
        self.submit_operation(operation).await
    }

    /// Submit a prepared operation.
    ///
    /// The operation is re-scoped to the active namespace.
    pub async fn submit_operation(
        &self,
        operation: SyncOperation,
    ) -> Result<SubmissionHandle, SyncError> {
        let (handle, outcome) = SubmissionHandle::new(operation.id);
        self.commands
            .send(Command::Submit { operation, outcome })
            .await
            .map_err(|_| SyncError::Stopped)?;
        Ok(handle)
    }

    /// Push the full application state unless it is identical to the last
    /// one sent for the active namespace.
    pub async fn submit_context(&self, context: Vec<u8>) -> Result<ContextOutcome, SyncError> {
        self.request(|reply| Command::SubmitContext { context, reply })
            .await?
    }

    /// Apply an update pushed by the host.
    pub async fn receive_remote(&self, update: RemoteUpdate) -> Result<RemoteOutcome, SyncError> {
        self.request(|reply| Command::ReceiveRemote { update, reply })
            .await?
    }

    /// Switch the active namespace, discarding everything scoped to the
    /// previous one. Returns the number of operations cancelled.
    pub async fn switch_namespace(&self, namespace: Namespace) -> Result<usize, SyncError> {
        self.request(|reply| Command::SwitchNamespace { namespace, reply })
            .await?
    }

    /// Cancel a queued, retrying or in-flight operation.
    ///
    /// Returns `false` if the operation already finished.
    pub async fn cancel(&self, operation_id: OperationId) -> Result<bool, SyncError> {
        self.request(|reply| Command::Cancel {
            operation_id,
            reply,
        })
        .await?
    }

    /// Run a full sync: course, then active round, then scorecard.
    ///
    /// Each sub-sync is submitted at high priority and awaited before the
    /// next starts. A failed sub-sync does not stop the later ones.
    ///
    /// # Errors
    ///
    /// [`SyncError::Throttled`] inside the cool-down window;
    /// [`SyncError::Stopped`] if the engine shuts down mid-sync.
    pub async fn sync_all<P>(&self, provider: &P) -> Result<FullSyncReport, SyncError>
    where
        P: SnapshotProvider + ?Sized,
    {
        self.request(|reply| Command::BeginFullSync { reply })
            .await??;

        let mut records = Vec::with_capacity(FULL_SYNC_ORDER.len());
        for entity_type in FULL_SYNC_ORDER {
            let record = self.sync_entity_type(provider, entity_type).await?;
            match &record.error {
                None => tracing::info!(
                    entity_type = %entity_type,
                    delivered = record.delivered,
                    "Sub-sync complete"
                ),
                Some(error) => tracing::warn!(
                    entity_type = %entity_type,
                    delivered = record.delivered,
                    "Sub-sync failed: {}",
                    error
                ),
            }
            let persisted = record.clone();
            self.request(|reply| Command::RecordSync {
                record: persisted,
                reply,
            })
            .await??;
            records.push(record);
        }

        Ok(FullSyncReport { records })
    }

    async fn sync_entity_type<P>(
        &self,
        provider: &P,
        entity_type: EntityType,
    ) -> Result<SyncRecord, SyncError>
    where
        P: SnapshotProvider + ?Sized,
    {
        let snapshots = match provider.snapshots(entity_type).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                return Ok(SyncRecord {
                    entity_type,
                    completed_at: unix_millis(),
                    delivered: 0,
                    error: Some(e.to_string()),
                })
            }
        };

        let mut handles = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let mut operation = SyncOperation::new(
                snapshot.key,
                Priority::High,
                snapshot.payload,
                Namespace::default(),
            );
            operation.progress = snapshot.progress;
            handles.push(self.submit_operation(operation).await?);
        }

        let mut delivered = 0;
        let mut error = None;
        for handle in handles {
            match handle.outcome().await {
                Ok(_) => delivered += 1,
                Err(SyncError::Stopped) => return Err(SyncError::Stopped),
                Err(e) => {
                    error.get_or_insert(e.to_string());
                }
            }
        }

        Ok(SyncRecord {
            entity_type,
            completed_at: unix_millis(),
            delivered,
            error,
        })
    }

    /// Feed an OS power event to the scheduler immediately.
    pub async fn report_power_event(&self, signal: PowerSignal) -> Result<(), SyncError> {
        self.power.report(signal).await
    }

    /// Cached winning version of an entity.
    pub async fn cached_snapshot(&self, key: EntityKey) -> Result<Option<EntitySnapshot>, SyncError> {
        self.request(|reply| Command::CachedSnapshot { key, reply })
            .await?
    }

    /// Hand an opaque blob to the transport.
    pub async fn transfer_blob(
        &self,
        data: Vec<u8>,
        metadata: BlobMetadata,
    ) -> Result<(), SyncError> {
        self.request(|reply| Command::TransferBlob {
            data,
            metadata,
            reply,
        })
        .await?
    }

    /// Current engine status.
    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Stop the drain loop.
    ///
    /// Unacknowledged operations stay in the pending store and are
    /// re-enqueued by the next [`SyncOrchestrator::start`]. Outstanding
    /// handles resolve with [`SyncError::Stopped`].
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| SyncError::Stopped)?;
        rx.await.map_err(|_| SyncError::Stopped)
    }
}

/// The actor. Owns every piece of mutable sync state.
struct Engine<T: Transport> {
    config: SyncConfig,
    transport: Arc<T>,
    queue: PriorityQueue,
    tracker: DeliveryTracker,
    compressor: PayloadCompressor,
    deduper: ContextDeduper,
    sequences: SequenceTracker,
    pending: PendingStore,
    namespace: Namespace,
    link: LinkState,
    reachable: bool,
    quality: ConnectionQuality,
    backoff_until: Option<Instant>,
    /// Operations whose send failed outright, waiting out a retry delay.
    delayed: Vec<(Instant, SyncOperation)>,
    waiters: HashMap<OperationId, Vec<OutcomeSender>>,
    /// Coalesced operation id -> surviving operation id.
    aliases: HashMap<OperationId, OperationId>,
    /// Send task per operation, tagged with the envelope it carries.
    sends: HashMap<OperationId, (EnvelopeId, AbortHandle)>,
    results_tx: mpsc::UnboundedSender<SendResult>,
    power: watch::Receiver<PowerProfile>,
    power_open: bool,
    observers: ObserverRegistry,
}

impl<T: Transport + 'static> Engine<T> {
    fn new(
        config: SyncConfig,
        transport: Arc<T>,
        pending: PendingStore,
        power: watch::Receiver<PowerProfile>,
        observers: ObserverRegistry,
        results_tx: mpsc::UnboundedSender<SendResult>,
    ) -> Self {
        let tracker = DeliveryTracker::new(
            config.delivery.timeouts(),
            config.delivery.max_attempts,
            LatencyWindow::new(config.delivery.latency_window),
        );
        let compressor = PayloadCompressor::new(
            config.compression.threshold_bytes,
            config.compression.cache_entries.max(1),
            config.compression.level,
        );

        Self {
            queue: PriorityQueue::new(config.queue.capacity),
            namespace: config.sync.initial_namespace(),
            tracker,
            compressor,
            deduper: ContextDeduper::new(),
            sequences: SequenceTracker::new(),
            pending,
            link: LinkState::new(),
            reachable: false,
            quality: ConnectionQuality::Unknown,
            backoff_until: None,
            delayed: Vec::new(),
            waiters: HashMap::new(),
            aliases: HashMap::new(),
            sends: HashMap::new(),
            results_tx,
            power,
            power_open: true,
            observers,
            transport,
            config,
        }
    }

    /// Reload the pending list, sequences and active namespace.
    async fn restore(&mut self) -> Result<(), SyncError> {
        if let Some(namespace) = self.pending.active_namespace().await? {
            self.namespace = namespace;
        }
        for (namespace, sequence) in self.pending.load_sequences().await? {
            self.sequences.resume(namespace, sequence);
        }
        for (namespace, sequence) in self.pending.load_inbound_sequences().await? {
            self.sequences.resume_inbound(namespace, sequence);
        }

        let operations = self.pending.load().await?;
        let (current, foreign): (Vec<_>, Vec<_>) = operations
            .into_iter()
            .partition(|op| op.namespace == self.namespace);

        let mut stale_namespaces: Vec<Namespace> =
            foreign.into_iter().map(|op| op.namespace).collect();
        stale_namespaces.sort();
        stale_namespaces.dedup();
        for namespace in &stale_namespaces {
            let purged = self.pending.purge_namespace(namespace).await?;
            tracing::info!(
                namespace = %namespace,
                "Discarded {} pending operations from inactive namespace",
                purged.len()
            );
        }

        let restored = current.len();
        for operation in current {
            self.enqueue(operation).await;
        }
        if restored > 0 {
            tracing::info!(namespace = %self.namespace, "Restored {} pending operations", restored);
        }
        Ok(())
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut results: mpsc::UnboundedReceiver<SendResult>,
    ) {
        tracing::info!(
            namespace = %self.namespace,
            queued = self.queue.len(),
            "Sync orchestrator started"
        );

        let mut poll = interval(REACHABILITY_POLL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.refresh_link();
            self.release_due_retries().await;
            self.drain().await;

            let far = Instant::now() + IDLE_WAIT;
            let ack_deadline = self.tracker.next_deadline().map(Instant::from_std);
            let retry_at = self.delayed.iter().map(|(at, _)| *at).min();
            let backoff_until = self.backoff_until;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.stop();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some(sent) = results.recv() => self.on_send_result(sent).await,
                _ = sleep_until(ack_deadline.unwrap_or(far)), if ack_deadline.is_some() => {
                    self.expire_deliveries().await;
                }
                // Due retries are released at the top of the loop.
                _ = sleep_until(retry_at.unwrap_or(far)), if retry_at.is_some() => {}
                _ = sleep_until(backoff_until.unwrap_or(far)), if backoff_until.is_some() => {
                    self.backoff_until = None;
                    self.apply_link_event(LinkEvent::BackoffElapsed);
                }
                changed = self.power.changed(), if self.power_open => {
                    if changed.is_err() {
                        tracing::warn!("Power monitor gone; keeping last profile");
                        self.power_open = false;
                    }
                }
                _ = poll.tick() => {}
            }
        }

        tracing::info!(pending = self.pending.len(), "Sync orchestrator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { operation, outcome } => self.submit(operation, outcome).await,
            Command::SubmitContext { context, reply } => {
                let _ = reply.send(self.submit_context(context).await);
            }
            Command::ReceiveRemote { update, reply } => {
                let _ = reply.send(self.receive_remote(update).await);
            }
            Command::SwitchNamespace { namespace, reply } => {
                let _ = reply.send(self.switch_namespace(namespace).await);
            }
            Command::Cancel {
                operation_id,
                reply,
            } => {
                let cancelled = self.cancel(operation_id, "cancelled by caller").await;
                let _ = reply.send(Ok(cancelled));
            }
            Command::BeginFullSync { reply } => {
                let _ = reply.send(self.begin_full_sync().await);
            }
            Command::RecordSync { record, reply } => {
                let _ = reply.send(self.pending.record_sync(&record).await);
            }
            Command::CachedSnapshot { key, reply } => {
                let _ = reply.send(self.pending.cached_snapshot(&key).await);
            }
            Command::TransferBlob {
                data,
                metadata,
                reply,
            } => {
                let result = self
                    .transport
                    .transfer_blob(data, metadata)
                    .await
                    .map_err(SyncError::from);
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop.
                let _ = reply.send(());
            }
        }
    }

    fn status(&self) -> SyncStatus {
        SyncStatus {
            namespace: self.namespace.clone(),
            queued: self.queue.len(),
            in_flight: self.tracker.in_flight_count(),
            awaiting_retry: self.delayed.len(),
            pending: self.pending.len(),
            link: self.link,
            quality: self.quality,
            level: self.level(),
        }
    }

    fn level(&self) -> OptimizationLevel {
        self.power.borrow().optimization_level
    }

    fn stop(&mut self) {
        for (_, (_, task)) in self.sends.drain() {
            task.abort();
        }
        // Dropping the senders resolves outstanding handles with Stopped.
        self.waiters.clear();
    }

    // =========================================================================
    // Link
    // =========================================================================

    fn refresh_link(&mut self) {
        let reachable = self.transport.is_reachable() && self.transport.is_activated();
        if reachable == self.reachable {
            return;
        }

        self.reachable = reachable;
        tracing::info!(reachable, "Host reachability changed");
        self.apply_link_event(LinkEvent::ReachabilityChanged { reachable });
        self.refresh_quality();
    }

    fn apply_link_event(&mut self, event: LinkEvent) {
        let (next, actions) = self.link.on_event(event);
        self.link = next;

        for action in actions {
            match action {
                LinkAction::StartBackoffTimer { delay } => {
                    tracing::debug!("Link backing off for {:?}", delay);
                    self.backoff_until = Some(Instant::now() + delay);
                }
                LinkAction::CancelBackoff => self.backoff_until = None,
                // The loop drains on every iteration.
                LinkAction::Drain => {}
                LinkAction::Emit(notice) => {
                    self.observers.publish(SyncEvent::LinkChanged { notice });
                }
            }
        }
    }

    fn refresh_quality(&mut self) {
        let quality = self.tracker.quality(self.reachable);
        if quality != self.quality {
            tracing::debug!("Connection quality {} -> {}", self.quality, quality);
            self.quality = quality;
            self.observers.publish(SyncEvent::QualityChanged { quality });
        }
    }

    // =========================================================================
    // Drain
    // =========================================================================

    async fn drain(&mut self) {
        let floor = eligibility_floor(self.level());
        while self.tracker.in_flight_count() < self.config.queue.max_in_flight {
            // The head outranks everything behind it.
            let admitted = self
                .queue
                .peek()
                .is_some_and(|head| self.link.admits(head.priority));
            if !admitted {
                break;
            }
            let Some(operation) = self.queue.dequeue_at_least(floor) else {
                break;
            };
            self.dispatch(operation).await;
        }
    }

    async fn dispatch(&mut self, operation: SyncOperation) {
        let payload = match self.compressor.compress_if_beneficial(&operation.payload) {
            Ok(payload) => payload,
            Err(e) => {
                let error = SyncError::EncodingFailure(e.to_string());
                self.finish_failed(operation, error).await;
                return;
            }
        };

        let sequence = self.sequences.next_outbound(&operation.namespace);
        if let Err(e) = self
            .pending
            .store_sequence(&operation.namespace, sequence)
            .await
        {
            tracing::warn!(namespace = %operation.namespace, "Failed to persist sequence: {}", e);
        }

        let envelope =
            MessageEnvelope::wrap(&operation, sequence, payload.bytes, payload.compressed);
        let operation_id = operation.id;
        let envelope_id = envelope.id;

        tracing::debug!(
            operation_id = %operation_id,
            entity = %operation.entity,
            priority = %operation.priority,
            attempt = operation.retry_count,
            sequence = %sequence,
            compressed = envelope.compressed,
            "Sending envelope"
        );

        self.tracker
            .register(envelope_id, operation, Instant::now().into_std());

        let transport = Arc::clone(&self.transport);
        let results = self.results_tx.clone();
        let task = tokio::spawn(async move {
            let result = transport.send(&envelope).await;
            let _ = results.send(SendResult {
                operation_id,
                envelope_id,
                result,
            });
        });
        self.sends
            .insert(operation_id, (envelope_id, task.abort_handle()));
    }

    async fn release_due_retries(&mut self) {
        if self.delayed.is_empty() {
            return;
        }

        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.delayed = waiting;

        for (_, operation) in due {
            self.enqueue(operation).await;
        }
    }

    async fn enqueue(&mut self, operation: SyncOperation) {
        match self.queue.enqueue(operation) {
            EnqueueOutcome::Queued { evicted: None } => {}
            EnqueueOutcome::Queued {
                evicted: Some(victim),
            }
            | EnqueueOutcome::Rejected(victim) => self.evict(victim).await,
            EnqueueOutcome::Coalesced {
                superseded,
                survivor,
            } => {
                tracing::debug!(
                    entity = %superseded.entity,
                    "Coalesced {} into {}",
                    superseded.id,
                    survivor
                );
                self.forget_pending(&superseded.id).await;

                if let Some(moved) = self.waiters.remove(&superseded.id) {
                    self.waiters.entry(survivor).or_default().extend(moved);
                }
                for target in self.aliases.values_mut() {
                    if *target == superseded.id {
                        *target = survivor;
                    }
                }
                self.aliases.insert(superseded.id, survivor);

                // The survivor may have inherited a higher priority.
                let merged = self
                    .queue
                    .find_entity(&superseded.namespace, &superseded.entity)
                    .cloned();
                if let Some(merged) = merged {
                    self.persist_update(&merged).await;
                }
            }
        }
    }

    async fn evict(&mut self, victim: SyncOperation) {
        let capacity = self.queue.capacity();
        tracing::warn!(
            operation_id = %victim.id,
            entity = %victim.entity,
            priority = %victim.priority,
            "Queue full ({}), evicting",
            capacity
        );
        self.forget_pending(&victim.id).await;
        self.observers.publish(SyncEvent::Evicted {
            operation_id: victim.id,
            entity: victim.entity.clone(),
        });
        self.fail_waiters(victim.id, SyncError::QueueCapacityExceeded { capacity });
    }

    // =========================================================================
    // Delivery results
    // =========================================================================

    async fn on_send_result(&mut self, sent: SendResult) {
        // A late result from an earlier attempt leaves the current send alone.
        let current = self
            .sends
            .get(&sent.operation_id)
            .is_some_and(|(envelope_id, _)| *envelope_id == sent.envelope_id);
        if current {
            self.sends.remove(&sent.operation_id);
        }

        match sent.result {
            Ok(ack) => self.on_ack(sent.envelope_id, ack).await,
            Err(e) => {
                let error = SyncError::from(e);
                let Some(decision) = self.tracker.fail(&sent.envelope_id) else {
                    return;
                };

                if error.is_retryable() {
                    self.apply_link_event(LinkEvent::SendFailed {
                        error: error.to_string(),
                    });
                    let delay = calculate_backoff(decision.operation().retry_count);
                    self.settle_failure(decision, error.to_string(), Some(delay))
                        .await;
                } else {
                    let operation = match decision {
                        FailureDecision::Retry(operation)
                        | FailureDecision::Exhausted { operation, .. } => operation,
                    };
                    self.finish_failed(operation, error).await;
                }
            }
        }
    }

    async fn on_ack(&mut self, envelope_id: EnvelopeId, ack: Ack) {
        let Some(AckedDelivery { operation, latency }) = self
            .tracker
            .ack(&envelope_id, Instant::now().into_std())
        else {
            tracing::debug!("Ignoring late ack for envelope {}", envelope_id);
            return;
        };

        self.apply_link_event(LinkEvent::SendSucceeded);
        self.forget_pending(&operation.id).await;

        let local = EntitySnapshot::from(&operation);
        let winner = match ack.remote {
            Some(remote) => self.reconcile(&local, remote).snapshot,
            None => local,
        };
        if let Err(e) = self.pending.cache_snapshot(&winner).await {
            tracing::warn!(entity = %winner.key, "Failed to cache snapshot: {}", e);
        }

        tracing::debug!(
            operation_id = %operation.id,
            entity = %operation.entity,
            "Acked after {:?}",
            latency
        );
        self.observers.publish(SyncEvent::Acked {
            operation_id: operation.id,
            entity: operation.entity.clone(),
            latency,
        });

        let delivered = operation.id;
        self.resolve_waiters(
            delivered,
            Ok(DeliveryOutcome::Acked {
                operation_id: delivered,
                latency,
            }),
        );
        self.refresh_quality();
    }

    async fn expire_deliveries(&mut self) {
        let decisions = self.tracker.expire(Instant::now().into_std());
        if decisions.is_empty() {
            return;
        }

        for decision in &decisions {
            self.abort_send(&decision.operation().id);
        }

        let reason = SyncError::Timeout.to_string();
        self.apply_link_event(LinkEvent::SendFailed {
            error: reason.clone(),
        });
        for decision in decisions {
            self.settle_failure(decision, reason.clone(), None).await;
        }
    }

    /// Retry or give up. `delay` postpones the retry; `None` requeues now.
    async fn settle_failure(
        &mut self,
        decision: FailureDecision,
        reason: String,
        delay: Option<Duration>,
    ) {
        match decision {
            FailureDecision::Retry(operation) => {
                tracing::debug!(
                    operation_id = %operation.id,
                    entity = %operation.entity,
                    retry = operation.retry_count,
                    "Retrying: {}",
                    reason
                );
                self.persist_update(&operation).await;
                self.observers.publish(SyncEvent::Retrying {
                    operation_id: operation.id,
                    entity: operation.entity.clone(),
                    retry_count: operation.retry_count,
                    reason,
                });

                match delay {
                    Some(delay) => self.delayed.push((Instant::now() + delay, operation)),
                    None => self.enqueue(operation).await,
                }
            }
            FailureDecision::Exhausted {
                operation,
                attempts,
            } => {
                let error = SyncError::RetriesExhausted {
                    attempts,
                    last_error: reason,
                };
                self.finish_failed(operation, error).await;
            }
        }
    }

    async fn finish_failed(&mut self, operation: SyncOperation, error: SyncError) {
        tracing::warn!(
            operation_id = %operation.id,
            entity = %operation.entity,
            "Delivery failed: {}",
            error
        );
        self.forget_pending(&operation.id).await;
        self.observers.publish(SyncEvent::Failed {
            operation_id: operation.id,
            entity: operation.entity.clone(),
            error: error.to_string(),
        });
        self.fail_waiters(operation.id, error);
    }

    async fn finish_cancelled(&mut self, operation: SyncOperation, reason: &str) {
        tracing::debug!(
            operation_id = %operation.id,
            entity = %operation.entity,
            "Cancelled: {}",
            reason
        );
        self.forget_pending(&operation.id).await;
        self.observers.publish(SyncEvent::Cancelled {
            operation_id: operation.id,
            entity: operation.entity.clone(),
            reason: reason.to_string(),
        });
        self.fail_waiters(
            operation.id,
            SyncError::Cancelled {
                operation_id: operation.id,
                reason: reason.to_string(),
            },
        );
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn submit(&mut self, mut operation: SyncOperation, outcome: OutcomeSender) {
        operation.namespace = self.namespace.clone();

        if let Err(e) = self.pending.record(&operation).await {
            tracing::error!(entity = %operation.entity, "Failed to persist submission: {}", e);
            let _ = outcome.send(Err(e));
            return;
        }

        tracing::debug!(
            operation_id = %operation.id,
            entity = %operation.entity,
            priority = %operation.priority,
            "Submitted"
        );
        self.waiters.entry(operation.id).or_default().push(outcome);
        self.enqueue(operation).await;
    }

    async fn submit_context(&mut self, context: Vec<u8>) -> Result<ContextOutcome, SyncError> {
        let namespace = self.namespace.clone();

        if !self.deduper.should_send(&namespace, &context) {
            tracing::debug!(namespace = %namespace, "Context unchanged, not sending");
            self.observers
                .publish(SyncEvent::ContextSuppressed { namespace });
            return Ok(ContextOutcome::Suppressed);
        }

        self.transport.update_application_context(&context).await?;
        let hash = self.deduper.mark_sent(namespace.clone(), &context);
        let digest = hex::encode(&hash.as_bytes()[..8]);

        let superseded = self.queue.purge_namespace(&namespace, true);
        let count = superseded.len();
        for operation in superseded {
            self.finish_cancelled(operation, "superseded by full-state context")
                .await;
        }

        tracing::debug!(
            namespace = %namespace,
            digest = %digest,
            bytes = context.len(),
            superseded = count,
            "Context sent"
        );
        self.observers
            .publish(SyncEvent::ContextSent { namespace, digest });
        Ok(ContextOutcome::Sent { superseded: count })
    }

    async fn receive_remote(&mut self, update: RemoteUpdate) -> Result<RemoteOutcome, SyncError> {
        if update.namespace != self.namespace {
            tracing::debug!(namespace = %update.namespace, "Ignoring update for inactive namespace");
            return Ok(RemoteOutcome::ForeignNamespace);
        }
        if !self
            .sequences
            .observe_inbound(&update.namespace, update.sequence)
        {
            tracing::debug!(
                sequence = %update.sequence,
                entity = %update.snapshot.key,
                "Dropping stale remote update"
            );
            return Ok(RemoteOutcome::Stale);
        }
        if let Err(e) = self
            .pending
            .store_inbound_sequence(&update.namespace, update.sequence)
            .await
        {
            tracing::warn!(namespace = %update.namespace, "Failed to persist inbound sequence: {}", e);
        }

        let remote = update.snapshot;
        let local = self.undelivered(&remote.key);

        if let Some(latest) = local.iter().max_by_key(|op| op.created_at) {
            let resolution = self.reconcile(&EntitySnapshot::from(latest), remote);
            if resolution.winner == Side::Remote {
                for operation in local {
                    self.cancel(operation.id, "superseded by remote update")
                        .await;
                }
                self.pending.cache_snapshot(&resolution.snapshot).await?;
            }
            return Ok(RemoteOutcome::Applied {
                winner: resolution.winner,
                rule: Some(resolution.rule),
            });
        }

        match self.pending.cached_snapshot(&remote.key).await? {
            Some(cached) => {
                let resolution = self.reconcile(&cached, remote);
                self.pending.cache_snapshot(&resolution.snapshot).await?;
                Ok(RemoteOutcome::Applied {
                    winner: resolution.winner,
                    rule: Some(resolution.rule),
                })
            }
            None => {
                self.pending.cache_snapshot(&remote).await?;
                Ok(RemoteOutcome::Applied {
                    winner: Side::Remote,
                    rule: None,
                })
            }
        }
    }

    /// Non-critical operations for an entity in the active namespace that
    /// are queued, waiting out a retry delay, or awaiting ack.
    fn undelivered(&self, key: &EntityKey) -> Vec<SyncOperation> {
        let namespace = &self.namespace;
        let delayed = self
            .delayed
            .iter()
            .map(|(_, op)| op)
            .filter(|op| &op.namespace == namespace && &op.entity == key);

        self.queue
            .find_entity(namespace, key)
            .into_iter()
            .chain(delayed)
            .chain(self.tracker.operations_for(namespace, key))
            .filter(|op| op.priority != Priority::Critical)
            .cloned()
            .collect()
    }

    fn reconcile(&self, local: &EntitySnapshot, remote: EntitySnapshot) -> Resolution {
        let resolution = resolve_conflict(local, &remote);
        if resolution.is_fallback() {
            let fallback = SyncError::ConflictFallback {
                entity: remote.key.clone(),
            };
            tracing::debug!("{}", fallback);
        }
        self.observers.publish(SyncEvent::ConflictResolved {
            entity: remote.key,
            winner: resolution.winner,
            rule: resolution.rule,
        });
        resolution
    }

    async fn switch_namespace(&mut self, namespace: Namespace) -> Result<usize, SyncError> {
        if namespace == self.namespace {
            return Ok(0);
        }

        self.pending.set_active_namespace(&namespace).await?;
        let previous = std::mem::replace(&mut self.namespace, namespace);

        let mut discarded = self.queue.purge_namespace(&previous, false);
        for record in self.tracker.remove_namespace(&previous) {
            self.abort_send(&record.operation.id);
            discarded.push(record.operation);
        }
        let (stale, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(_, op)| op.namespace == previous);
        self.delayed = waiting;
        discarded.extend(stale.into_iter().map(|(_, op)| op));

        self.pending.purge_namespace(&previous).await?;
        self.deduper.forget(&previous);

        let count = discarded.len();
        for operation in discarded {
            self.finish_cancelled(operation, "namespace switched").await;
        }

        tracing::info!(
            from = %previous,
            to = %self.namespace,
            cancelled = count,
            "Switched namespace"
        );
        Ok(count)
    }

    async fn cancel(&mut self, operation_id: OperationId, reason: &str) -> bool {
        let id = self.resolve_alias(operation_id);

        let operation = if let Some(operation) = self.queue.remove(&id) {
            Some(operation)
        } else if let Some(index) = self.delayed.iter().position(|(_, op)| op.id == id) {
            Some(self.delayed.swap_remove(index).1)
        } else if let Some(record) = self.tracker.remove_operation(&id) {
            self.abort_send(&id);
            Some(record.operation)
        } else {
            None
        };

        match operation {
            Some(operation) => {
                self.finish_cancelled(operation, reason).await;
                true
            }
            None => false,
        }
    }

    async fn begin_full_sync(&mut self) -> Result<(), SyncError> {
        let now = unix_millis();
        let cooldown = self.config.sync.cooldown().as_millis() as u64;

        if let Some(last) = self.pending.last_full_sync().await? {
            let elapsed = now.saturating_sub(last);
            if elapsed < cooldown {
                let retry_after_secs = (cooldown - elapsed).div_ceil(1000);
                tracing::debug!("Full sync throttled for {}s", retry_after_secs);
                return Err(SyncError::Throttled { retry_after_secs });
            }
        }

        tracing::info!(namespace = %self.namespace, "Starting full sync");
        self.pending.set_last_full_sync(now).await
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    fn abort_send(&mut self, id: &OperationId) {
        if let Some((_, task)) = self.sends.remove(id) {
            task.abort();
        }
    }

    fn resolve_alias(&self, mut id: OperationId) -> OperationId {
        // Chains are flattened on insert, so one hop is enough.
        if let Some(target) = self.aliases.get(&id) {
            id = *target;
        }
        id
    }

    fn resolve_waiters(&mut self, id: OperationId, outcome: Result<DeliveryOutcome, SyncError>) {
        self.aliases.retain(|_, target| *target != id);
        let Some(waiters) = self.waiters.remove(&id) else {
            return;
        };
        match outcome {
            Ok(delivered) => {
                for waiter in waiters {
                    let _ = waiter.send(Ok(delivered));
                }
            }
            Err(error) => {
                for waiter in waiters {
                    let _ = waiter.send(Err(replicate(&error)));
                }
            }
        }
    }

    fn fail_waiters(&mut self, id: OperationId, error: SyncError) {
        self.resolve_waiters(id, Err(error));
    }

    async fn forget_pending(&mut self, id: &OperationId) {
        if let Err(e) = self.pending.remove(id).await {
            tracing::error!(operation_id = %id, "Failed to update pending store: {}", e);
        }
    }

    async fn persist_update(&mut self, operation: &SyncOperation) {
        if let Err(e) = self.pending.update(operation).await {
            tracing::error!(operation_id = %operation.id, "Failed to update pending store: {}", e);
        }
    }
}

/// Copy an error for fan-out to several waiters.
fn replicate(error: &SyncError) -> SyncError {
    match error {
        SyncError::TransportUnavailable(reason) => SyncError::TransportUnavailable(reason.clone()),
        SyncError::Timeout => SyncError::Timeout,
        SyncError::EncodingFailure(reason) => SyncError::EncodingFailure(reason.clone()),
        SyncError::ConflictFallback { entity } => SyncError::ConflictFallback {
            entity: entity.clone(),
        },
        SyncError::QueueCapacityExceeded { capacity } => SyncError::QueueCapacityExceeded {
            capacity: *capacity,
        },
        SyncError::RetriesExhausted {
            attempts,
            last_error,
        } => SyncError::RetriesExhausted {
            attempts: *attempts,
            last_error: last_error.clone(),
        },
        SyncError::Cancelled {
            operation_id,
            reason,
        } => SyncError::Cancelled {
            operation_id: *operation_id,
            reason: reason.clone(),
        },
        SyncError::Throttled { retry_after_secs } => SyncError::Throttled {
            retry_after_secs: *retry_after_secs,
        },
        SyncError::Storage(reason) => SyncError::Storage(reason.clone()),
        SyncError::Serialization(e) => SyncError::EncodingFailure(e.to_string()),
        SyncError::Deserialization(e) => SyncError::InvalidData(e.to_string()),
        SyncError::InvalidData(reason) => SyncError::InvalidData(reason.clone()),
        SyncError::Stopped => SyncError::Stopped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::MockTransport;
    use linkwise_sync_core::PowerScheduler;

    #[test]
    fn full_sync_order_is_course_round_scorecard() {
        assert_eq!(
            FULL_SYNC_ORDER,
            [
                EntityType::Course,
                EntityType::ActiveRound,
                EntityType::Scorecard
            ]
        );
    }

    #[test]
    fn report_succeeds_only_if_every_record_does() {
        let ok = |entity_type| SyncRecord {
            entity_type,
            completed_at: 1,
            delivered: 1,
            error: None,
        };
        let mut report = FullSyncReport {
            records: FULL_SYNC_ORDER.into_iter().map(ok).collect(),
        };
        assert!(report.succeeded());
        assert_eq!(report.failures().count(), 0);

        report.records[0].error = Some("unreachable".into());
        assert!(!report.succeeded());
        assert_eq!(report.failures().count(), 1);
    }

    #[test]
    fn replicate_preserves_variant_and_fields() {
        let id = OperationId::new();
        let original = SyncError::Cancelled {
            operation_id: id,
            reason: "namespace switched".into(),
        };
        match replicate(&original) {
            SyncError::Cancelled {
                operation_id,
                reason,
            } => {
                assert_eq!(operation_id, id);
                assert_eq!(reason, "namespace switched");
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            replicate(&SyncError::RetriesExhausted {
                attempts: 3,
                last_error: "timeout".into()
            }),
            SyncError::RetriesExhausted { attempts: 3, .. }
        ));
    }

    // ===========================================
    // Send bookkeeping
    // ===========================================

    fn engine(transport: &MockTransport) -> (Engine<MockTransport>, watch::Sender<PowerProfile>) {
        let config = SyncConfig::default();
        let profile = PowerScheduler::new(config.power.scheduler()).profile().clone();
        let (power_tx, power_rx) = watch::channel(profile);
        let (results_tx, _) = mpsc::unbounded_channel();
        let engine = Engine::new(
            config,
            Arc::new(transport.clone()),
            PendingStore::new(Arc::new(MemoryStore::new())),
            power_rx,
            ObserverRegistry::new(),
            results_tx,
        );
        (engine, power_tx)
    }

    #[tokio::test]
    async fn late_result_from_earlier_envelope_keeps_current_send() {
        let transport = MockTransport::new();
        transport.black_hole(true);
        let (mut engine, _power) = engine(&transport);

        let operation = SyncOperation::new(
            EntityKey::new(EntityType::Scorecard, "s1"),
            Priority::Normal,
            vec![1],
            Namespace::default(),
        );
        let id = operation.id;
        engine.dispatch(operation).await;
        let current = engine.sends.get(&id).map(|(envelope_id, _)| *envelope_id);
        assert!(current.is_some());

        engine
            .on_send_result(SendResult {
                operation_id: id,
                envelope_id: EnvelopeId::new(),
                result: Err(TransportError::SendFailed("reset".into())),
            })
            .await;
        assert_eq!(
            engine.sends.get(&id).map(|(envelope_id, _)| *envelope_id),
            current
        );
        assert_eq!(engine.tracker.in_flight_count(), 1);

        engine
            .on_send_result(SendResult {
                operation_id: id,
                envelope_id: current.unwrap(),
                result: Err(TransportError::SendFailed("reset".into())),
            })
            .await;
        assert!(!engine.sends.contains_key(&id));
        assert_eq!(engine.tracker.in_flight_count(), 0);
        assert_eq!(engine.delayed.len(), 1);
    }
}
