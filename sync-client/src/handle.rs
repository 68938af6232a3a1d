//! Completion handles returned to callers of `submit`.

use std::time::Duration;

use linkwise_sync_types::{OperationId, SyncError};
use tokio::sync::oneshot;

/// How a submission ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The host acknowledged the operation.
    Acked {
        /// The operation that was delivered. Differs from the submitted id
        /// when the submission was coalesced into a newer one.
        operation_id: OperationId,
        /// Round-trip time of the final attempt.
        latency: Duration,
    },
}

pub(crate) type OutcomeSender = oneshot::Sender<Result<DeliveryOutcome, SyncError>>;

/// Resolves once the submitted operation is acked, fails permanently, or is
/// cancelled.
///
/// Dropping the handle does not cancel the operation.
#[derive(Debug)]
pub struct SubmissionHandle {
    operation_id: OperationId,
    rx: oneshot::Receiver<Result<DeliveryOutcome, SyncError>>,
}

impl SubmissionHandle {
    pub(crate) fn new(operation_id: OperationId) -> (Self, OutcomeSender) {
        let (tx, rx) = oneshot::channel();
        (Self { operation_id, rx }, tx)
    }

    /// Id assigned to the submitted operation.
    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    /// Wait for the final outcome.
    ///
    /// Returns [`SyncError::Stopped`] if the orchestrator shut down first.
    pub async fn outcome(self) -> Result<DeliveryOutcome, SyncError> {
        self.rx.await.unwrap_or(Err(SyncError::Stopped))
    }
}
