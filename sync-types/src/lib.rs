//! # sync-types
//!
//! Data model and wire types for the Linkwise sync engine.
//!
//! This crate provides the foundational types shared by every Linkwise crate:
//! - [`OperationId`], [`EnvelopeId`], [`Namespace`], [`SequenceNumber`] - Identity and ordering
//! - [`SyncOperation`], [`Priority`], [`EntityType`] - Units of domain-state change
//! - [`MessageEnvelope`], [`Ack`] - What actually crosses the link
//! - [`EntitySnapshot`], [`RemoteUpdate`] - Versions of an entity for reconciliation
//! - [`PowerSignal`], [`PowerProfile`] - Battery/thermal input and the derived schedule
//! - [`SyncError`] - Error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

mod envelope;
mod error;
mod ids;
mod operation;
mod power;
mod snapshot;

pub use envelope::{Ack, MessageEnvelope};
pub use error::SyncError;
pub use ids::{unix_millis, EnvelopeId, Namespace, OperationId, SequenceNumber};
pub use operation::{EntityKey, EntityType, Priority, SyncOperation};
pub use power::{OptimizationLevel, PowerProfile, PowerSignal, ThermalState};
pub use snapshot::{EntitySnapshot, RemoteUpdate};
