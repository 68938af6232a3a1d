//! Observer registry for sync events.
//!
//! Subscribers own their lifetime: the registry only keeps a [`Weak`]
//! reference, so dropping the last `Arc` unsubscribes implicitly. Dead
//! entries are pruned on the next publish.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use linkwise_sync_core::{ConnectionQuality, LinkNotice, ResolutionRule, Side};
use linkwise_sync_types::{EntityKey, Namespace, OperationId, OptimizationLevel};

/// Events published by the orchestrator and the power monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// An operation was delivered.
    Acked {
        /// The delivered operation.
        operation_id: OperationId,
        /// Its entity.
        entity: EntityKey,
        /// Round-trip time of the final attempt.
        latency: Duration,
    },
    /// An attempt failed and the operation will be retried.
    Retrying {
        /// The operation.
        operation_id: OperationId,
        /// Its entity.
        entity: EntityKey,
        /// Retries so far, including this one.
        retry_count: u32,
        /// Why the attempt failed.
        reason: String,
    },
    /// An operation failed permanently.
    Failed {
        /// The operation.
        operation_id: OperationId,
        /// Its entity.
        entity: EntityKey,
        /// The terminal error.
        error: String,
    },
    /// An operation was cancelled before delivery.
    Cancelled {
        /// The operation.
        operation_id: OperationId,
        /// Its entity.
        entity: EntityKey,
        /// Why.
        reason: String,
    },
    /// An operation was evicted from a full queue.
    Evicted {
        /// The operation.
        operation_id: OperationId,
        /// Its entity.
        entity: EntityKey,
    },
    /// The power scheduler changed level.
    LevelChanged {
        /// Previous level.
        from: OptimizationLevel,
        /// New level.
        to: OptimizationLevel,
    },
    /// Connection quality changed.
    QualityChanged {
        /// New quality.
        quality: ConnectionQuality,
    },
    /// The link state changed.
    LinkChanged {
        /// What happened.
        notice: LinkNotice,
    },
    /// A full-state context was pushed.
    ContextSent {
        /// Namespace it belongs to.
        namespace: Namespace,
        /// Short hex digest of the context.
        digest: String,
    },
    /// A full-state context was identical to the last one and was not sent.
    ContextSuppressed {
        /// Namespace it belongs to.
        namespace: Namespace,
    },
    /// Local and remote versions of an entity were reconciled.
    ConflictResolved {
        /// The entity.
        entity: EntityKey,
        /// Which side won.
        winner: Side,
        /// Which rule decided.
        rule: ResolutionRule,
    },
}

/// Receives sync events.
///
/// Called synchronously from the publishing task; implementations should
/// return quickly.
pub trait SyncObserver: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &SyncEvent);
}

/// Registration token returned by [`ObserverRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    observers: Vec<(ObserverId, Weak<dyn SyncObserver>)>,
}

/// Registry of weakly held observers. Clones share the same registry.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ObserverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        // A panicking observer must not take the registry down with it.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe an observer. The registry does not keep it alive.
    pub fn register<O: SyncObserver + 'static>(&self, observer: &Arc<O>) -> ObserverId {
        let weak: Weak<dyn SyncObserver> = Arc::downgrade(observer) as Weak<dyn SyncObserver>;
        let mut inner = self.lock();
        let id = ObserverId(inner.next_id);
        inner.next_id += 1;
        inner.observers.push((id, weak));
        id
    }

    /// Unsubscribe. Returns whether the id was registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut inner = self.lock();
        let before = inner.observers.len();
        inner.observers.retain(|(existing, _)| *existing != id);
        inner.observers.len() != before
    }

    /// Deliver an event to every live observer.
    pub fn publish(&self, event: SyncEvent) {
        let live: Vec<Arc<dyn SyncObserver>> = {
            let mut inner = self.lock();
            inner
                .observers
                .retain(|(_, weak)| weak.strong_count() > 0);
            inner
                .observers
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };

        // Lock released: observers may register/unregister from on_event.
        for observer in live {
            observer.on_event(&event);
        }
    }

    /// Number of live observers.
    pub fn len(&self) -> usize {
        self.lock()
            .observers
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    /// Check if no live observers remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.len())
            .finish()
    }
}

/// Observer that records every event. Useful in tests and the CLI.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<SyncEvent>>,
}

impl EventLog {
    /// Create an empty log.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every event received so far.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl SyncObserver for EventLog {
    fn on_event(&self, event: &SyncEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
