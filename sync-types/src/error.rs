//! Error types for Linkwise.

use thiserror::Error;

use crate::{EntityKey, OperationId};

/// Errors that can occur in Linkwise sync operations.
///
/// Callers always learn the terminal outcome of a submission through one of
/// these (or an ack). Transient variants are retried transparently first.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Session inactive or peer unreachable.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Ack deadline exceeded.
    #[error("operation timed out")]
    Timeout,

    /// Serialization or compression failed. Never retried.
    #[error("encoding failed: {0}")]
    EncodingFailure(String),

    /// The conflict resolver fell back to the remote side.
    ///
    /// Logged only; never delivered to a submitter.
    #[error("conflict on {entity} resolved by fallback to remote")]
    ConflictFallback {
        /// The contested entity.
        entity: EntityKey,
    },

    /// The bounded queue overflowed and this operation was evicted.
    #[error("queue capacity exceeded (capacity: {capacity})")]
    QueueCapacityExceeded {
        /// Queue capacity.
        capacity: usize,
    },

    /// Transient failures persisted through every allowed attempt.
    #[error("delivery failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// The failure seen on the final attempt.
        last_error: String,
    },

    /// The operation was cancelled before delivery.
    #[error("operation {operation_id} cancelled: {reason}")]
    Cancelled {
        /// The cancelled operation.
        operation_id: OperationId,
        /// Why it was cancelled.
        reason: String,
    },

    /// A full sync was requested inside the cool-down window.
    #[error("full sync throttled, retry in {retry_after_secs}s")]
    Throttled {
        /// Seconds until the next full sync is allowed.
        retry_after_secs: u64,
    },

    /// Persistence collaborator failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The sync engine has shut down.
    #[error("sync engine stopped")]
    Stopped,
}

impl SyncError {
    /// Whether the failure is transient and may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransportUnavailable(_) | SyncError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityType;

    #[test]
    fn error_display() {
        let err = SyncError::QueueCapacityExceeded { capacity: 64 };
        assert_eq!(err.to_string(), "queue capacity exceeded (capacity: 64)");

        let err = SyncError::ConflictFallback {
            entity: EntityKey::new(EntityType::Scorecard, "r1"),
        };
        assert_eq!(
            err.to_string(),
            "conflict on scorecard:r1 resolved by fallback to remote"
        );
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(SyncError::TransportUnavailable("down".into()).is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(!SyncError::EncodingFailure("bad".into()).is_retryable());
        assert!(!SyncError::QueueCapacityExceeded { capacity: 1 }.is_retryable());
        assert!(!SyncError::Stopped.is_retryable());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SyncError>();
    }
}
