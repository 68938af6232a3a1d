//! Mock transport for testing.
//!
//! Records everything sent and lets tests script failures, silent drops,
//! ack latency and host snapshots attached to acks.

use super::{BlobMetadata, Transport, TransportError, DEFAULT_MAX_CONTEXT_SIZE};
use async_trait::async_trait;
use linkwise_sync_types::{Ack, EntitySnapshot, EntityType, MessageEnvelope};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Mock transport for testing.
///
/// Clones share state, so a test can keep one clone while the orchestrator
/// owns another.
#[derive(Debug, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug)]
struct MockTransportInner {
    reachable: bool,
    activated: bool,
    sent: Vec<MessageEnvelope>,
    contexts: Vec<Vec<u8>>,
    blobs: Vec<(Vec<u8>, BlobMetadata)>,
    fail_next_send: VecDeque<String>,
    failing_types: HashSet<EntityType>,
    black_hole: bool,
    ack_latency: Duration,
    next_remote: Option<EntitySnapshot>,
    max_context_size: usize,
}

impl Default for MockTransportInner {
    fn default() -> Self {
        Self {
            reachable: true,
            activated: true,
            sent: Vec::new(),
            contexts: Vec::new(),
            blobs: Vec::new(),
            fail_next_send: VecDeque::new(),
            failing_types: HashSet::new(),
            black_hole: false,
            ack_latency: Duration::ZERO,
            next_remote: None,
            max_context_size: DEFAULT_MAX_CONTEXT_SIZE,
        }
    }
}

impl MockTransport {
    /// Create a new mock transport (reachable, activated, instant acks).
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().expect("mock transport mutex poisoned")
    }

    /// Toggle reachability.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Toggle session activation.
    pub fn set_activated(&self, activated: bool) {
        self.lock().activated = activated;
    }

    /// Accept sends but never ack them.
    pub fn black_hole(&self, enabled: bool) {
        self.lock().black_hole = enabled;
    }

    /// Cause the next send() to fail with the given error.
    ///
    /// Calls stack: each queued error fails one send.
    pub fn fail_next_send(&self, error: &str) {
        self.lock().fail_next_send.push_back(error.to_string());
    }

    /// Fail every send for an entity type until cleared.
    pub fn fail_entity_type(&self, entity_type: EntityType) {
        self.lock().failing_types.insert(entity_type);
    }

    /// Stop failing sends for an entity type.
    pub fn clear_entity_failures(&self) {
        self.lock().failing_types.clear();
    }

    /// Delay every ack by `latency`.
    pub fn set_ack_latency(&self, latency: Duration) {
        self.lock().ack_latency = latency;
    }

    /// Attach a host snapshot to the next ack.
    pub fn set_remote_snapshot(&self, snapshot: EntitySnapshot) {
        self.lock().next_remote = Some(snapshot);
    }

    /// Override the application context bound.
    pub fn set_max_context_size(&self, max: usize) {
        self.lock().max_context_size = max;
    }

    /// Every envelope handed to send(), including dropped and failed ones.
    pub fn sent_envelopes(&self) -> Vec<MessageEnvelope> {
        self.lock().sent.clone()
    }

    /// Number of envelopes handed to send().
    pub fn sent_count(&self) -> usize {
        self.lock().sent.len()
    }

    /// Every application context accepted.
    pub fn contexts(&self) -> Vec<Vec<u8>> {
        self.lock().contexts.clone()
    }

    /// Every blob transferred.
    pub fn blobs(&self) -> Vec<(Vec<u8>, BlobMetadata)> {
        self.lock().blobs.clone()
    }

    /// Clear all state.
    pub fn reset(&self) {
        *self.lock() = MockTransportInner::default();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, envelope: &MessageEnvelope) -> Result<Ack, TransportError> {
        let (latency, remote) = {
            let mut inner = self.lock();

            if !inner.activated {
                return Err(TransportError::NotActivated);
            }
            if !inner.reachable {
                return Err(TransportError::Unreachable);
            }

            inner.sent.push(envelope.clone());

            // Check for forced failure
            if let Some(error) = inner.fail_next_send.pop_front() {
                return Err(TransportError::SendFailed(error));
            }
            if inner.failing_types.contains(&envelope.entity.entity_type) {
                return Err(TransportError::SendFailed(format!(
                    "{} sends are failing",
                    envelope.entity.entity_type
                )));
            }

            if inner.black_hole {
                (None, None)
            } else {
                (Some(inner.ack_latency), inner.next_remote.take())
            }
        };

        let Some(latency) = latency else {
            // Silently dropped: the ack never arrives.
            std::future::pending::<()>().await;
            return Err(TransportError::SendFailed("dropped".into()));
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut ack = Ack::for_envelope(envelope);
        ack.remote = remote;
        Ok(ack)
    }

    fn is_reachable(&self) -> bool {
        self.lock().reachable
    }

    fn is_activated(&self) -> bool {
        self.lock().activated
    }

    async fn update_application_context(&self, context: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.lock();

        if !inner.activated {
            return Err(TransportError::NotActivated);
        }
        if context.len() > inner.max_context_size {
            return Err(TransportError::ContextTooLarge {
                size: context.len(),
                max: inner.max_context_size,
            });
        }

        inner.contexts.push(context.to_vec());
        Ok(())
    }

    fn application_context(&self) -> Option<Vec<u8>> {
        self.lock().contexts.last().cloned()
    }

    fn max_context_size(&self) -> usize {
        self.lock().max_context_size
    }

    async fn transfer_blob(
        &self,
        data: Vec<u8>,
        metadata: BlobMetadata,
    ) -> Result<(), TransportError> {
        let mut inner = self.lock();

        if !inner.reachable {
            return Err(TransportError::Unreachable);
        }

        inner.blobs.push((data, metadata));
        Ok(())
    }
}
