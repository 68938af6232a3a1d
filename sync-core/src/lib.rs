//! # sync-core
//!
//! Pure logic for Linkwise sync (no I/O, instant tests).
//!
//! This crate implements the data structures and policies of the sync engine
//! without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. Time is passed in as an [`std::time::Instant`] rather
//! than read from a clock. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (transport, persistence, timers) is performed by
//! `sync-client`, which drives these components from its drain loop.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compression;
pub mod conflict;
pub mod link;
pub mod quality;
pub mod queue;
pub mod scheduler;
pub mod sequence;
pub mod tracker;

pub use compression::{CompressedPayload, CompressionError, ContextDeduper, PayloadCompressor};
pub use conflict::{resolve_conflict, Resolution, ResolutionRule, Side};
pub use link::{LinkAction, LinkEvent, LinkNotice, LinkState};
pub use quality::{ConnectionQuality, LatencyWindow};
pub use queue::{EnqueueOutcome, PriorityQueue};
pub use scheduler::{
    HysteresisThresholds, LevelMultipliers, LevelTransition, PowerScheduler, SchedulerConfig,
};
pub use sequence::SequenceTracker;
pub use tracker::{AckedDelivery, DeliveryRecord, DeliveryTimeouts, DeliveryTracker, FailureDecision};
