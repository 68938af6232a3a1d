//! Transport abstraction for Linkwise.
//!
//! This module provides a pluggable transport layer that abstracts the
//! device/host link (a watch session, a BLE bridge, a mock for testing).
//!
//! # Design
//!
//! The transport trait is async and message-oriented:
//! - `send()` transmits one envelope and resolves with the host's ack
//! - `is_reachable()` / `is_activated()` expose the session signal
//! - `update_application_context()` is the last-write-wins full-state channel
//! - `transfer_blob()` is an opaque pass-through for large files
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::new();
//! let ack = transport.send(&envelope).await?;
//! assert_eq!(ack.envelope_id, envelope.id);
//! ```

mod mock;

pub use mock::MockTransport;

use async_trait::async_trait;
use linkwise_sync_types::{Ack, MessageEnvelope, SyncError};
use thiserror::Error;

/// Default upper bound on an application context, in bytes.
pub const DEFAULT_MAX_CONTEXT_SIZE: usize = 64 * 1024;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The host cannot be reached.
    #[error("host unreachable")]
    Unreachable,

    /// The session is not activated.
    #[error("session not activated")]
    NotActivated,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Application context exceeds the transport's bound.
    #[error("application context too large ({size} > {max} bytes)")]
    ContextTooLarge {
        /// Size of the rejected context.
        size: usize,
        /// The transport's limit.
        max: usize,
    },

    /// The host refused the message.
    #[error("rejected by host: {0}")]
    Rejected(String),
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ContextTooLarge { .. } => SyncError::EncodingFailure(err.to_string()),
            other => SyncError::TransportUnavailable(other.to_string()),
        }
    }
}

/// Descriptive metadata for an opaque blob transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetadata {
    /// File name shown on the host.
    pub name: String,
    /// MIME type, if known.
    pub content_type: Option<String>,
}

impl BlobMetadata {
    /// Metadata with just a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content_type: None,
        }
    }
}

/// Transport trait for moving sync traffic between device and host.
///
/// Implementations handle the underlying link (watch session, BLE, mock).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one envelope and wait for the host's ack.
    ///
    /// May never resolve if the host silently drops the message; callers
    /// enforce their own deadline.
    async fn send(&self, envelope: &MessageEnvelope) -> Result<Ack, TransportError>;

    /// Whether the host is currently reachable.
    fn is_reachable(&self) -> bool;

    /// Whether the session is activated.
    fn is_activated(&self) -> bool;

    /// Replace the full application context (last write wins).
    async fn update_application_context(&self, context: &[u8]) -> Result<(), TransportError>;

    /// The last application context accepted by the transport.
    fn application_context(&self) -> Option<Vec<u8>>;

    /// Largest accepted application context, in bytes.
    fn max_context_size(&self) -> usize {
        DEFAULT_MAX_CONTEXT_SIZE
    }

    /// Hand a blob to the transport's file channel.
    async fn transfer_blob(&self, data: Vec<u8>, metadata: BlobMetadata)
        -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_to_sync_errors() {
        let err: SyncError = TransportError::Unreachable.into();
        assert!(err.is_retryable());

        let err: SyncError = TransportError::SendFailed("reset".into()).into();
        assert!(matches!(err, SyncError::TransportUnavailable(_)));

        let err: SyncError = TransportError::ContextTooLarge { size: 10, max: 5 }.into();
        assert!(matches!(err, SyncError::EncodingFailure(_)));
        assert!(!err.is_retryable());
    }
}
