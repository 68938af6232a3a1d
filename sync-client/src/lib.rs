//! # sync-client
//!
//! Async sync engine for Linkwise.
//!
//! This is the library applications embed to move domain state between a
//! device and its host.
//!
//! ## Features
//!
//! - **Priority Delivery**: Critical traffic first, latest-wins coalescing
//! - **Ack Tracking**: Per-priority deadlines with bounded retries
//! - **Restart Survival**: Unacknowledged operations persist in a key-value store
//! - **Power Awareness**: Battery/thermal level gates what the drain loop sends
//! - **Pure Core**: Uses sync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use linkwise_sync_client::{
//!     spawn_power_monitor, ManualPowerSource, MemoryStore, MockTransport,
//!     ObserverRegistry, SyncConfig, SyncOrchestrator,
//! };
//!
//! let config = SyncConfig::default();
//! let observers = ObserverRegistry::new();
//! let (power, _task) = spawn_power_monitor(
//!     ManualPowerSource::default(),
//!     PowerScheduler::new(config.power.scheduler()),
//!     config.power.sample_interval(),
//!     observers.clone(),
//! );
//! let sync = SyncOrchestrator::start(
//!     config,
//!     Arc::new(MockTransport::new()),
//!     Arc::new(MemoryStore::new()),
//!     power,
//!     observers,
//! )
//! .await?;
//!
//! let handle = sync
//!     .submit(EntityKey::new(EntityType::Scorecard, "round-1"), payload, Priority::High)
//!     .await?;
//! handle.outcome().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod events;
pub mod handle;
pub mod orchestrator;
pub mod pending;
pub mod power;
pub mod store;
pub mod transport;

pub use config::{ConfigError, SyncConfig};
pub use events::{EventLog, ObserverId, ObserverRegistry, SyncEvent, SyncObserver};
pub use handle::{DeliveryOutcome, SubmissionHandle};
pub use orchestrator::{
    ContextOutcome, FullSyncReport, RemoteOutcome, SnapshotProvider, SyncOrchestrator,
    SyncStatus, FULL_SYNC_ORDER,
};
pub use pending::{PendingStore, SyncRecord};
pub use power::{spawn_power_monitor, ManualPowerSource, PowerMonitor, PowerSource};
pub use store::{KeyValueStore, MemoryStore, SqliteStore, StorageError};
pub use transport::{BlobMetadata, MockTransport, Transport, TransportError};
