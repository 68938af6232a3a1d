//! Delivery tracking for Linkwise.
//!
//! This module provides per-envelope bookkeeping while an operation is in
//! flight:
//! - A deadline per envelope, derived from the operation's priority
//! - Retry-or-give-up decisions on timeout or transient failure
//! - Round-trip latency sampling on ack, feeding connection quality
//!
//! Records exist only while in flight; ack, failure and expiry remove them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use linkwise_sync_types::{EntityKey, EnvelopeId, Namespace, OperationId, Priority, SyncOperation};

use crate::quality::{ConnectionQuality, LatencyWindow};

/// Default maximum number of send attempts per operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Most send attempts any operation gets (three retries after the first).
pub const MAX_ATTEMPTS_LIMIT: u32 = 4;

/// Ack deadline per priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTimeouts {
    /// Deadline for critical envelopes.
    pub critical: Duration,
    /// Deadline for high envelopes.
    pub high: Duration,
    /// Deadline for normal envelopes.
    pub normal: Duration,
    /// Deadline for low envelopes.
    pub low: Duration,
}

impl DeliveryTimeouts {
    /// Deadline for a priority.
    pub fn for_priority(&self, priority: Priority) -> Duration {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }
}

impl Default for DeliveryTimeouts {
    fn default() -> Self {
        Self {
            critical: Priority::Critical.default_ack_timeout(),
            high: Priority::High.default_ack_timeout(),
            normal: Priority::Normal.default_ack_timeout(),
            low: Priority::Low.default_ack_timeout(),
        }
    }
}

/// An envelope awaiting ack.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    /// The envelope on the wire.
    pub envelope_id: EnvelopeId,
    /// The operation it carries.
    pub operation: SyncOperation,
    /// When it was handed to the transport.
    pub sent_at: Instant,
    /// When it times out.
    pub deadline: Instant,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// A confirmed delivery.
#[derive(Debug, Clone)]
pub struct AckedDelivery {
    /// The delivered operation.
    pub operation: SyncOperation,
    /// Round-trip time from send to ack.
    pub latency: Duration,
}

/// What to do after a failed or expired delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    /// Re-enqueue at the original priority; `retry_count` already incremented.
    Retry(SyncOperation),
    /// Out of attempts; report permanent failure.
    Exhausted {
        /// The failed operation.
        operation: SyncOperation,
        /// Attempts made.
        attempts: u32,
    },
}

impl FailureDecision {
    /// The operation the decision applies to.
    pub fn operation(&self) -> &SyncOperation {
        match self {
            FailureDecision::Retry(op) => op,
            FailureDecision::Exhausted { operation, .. } => operation,
        }
    }
}

/// Tracks in-flight envelopes and their deadlines.
#[derive(Debug)]
pub struct DeliveryTracker {
    in_flight: HashMap<EnvelopeId, DeliveryRecord>,
    timeouts: DeliveryTimeouts,
    max_attempts: u32,
    latency: LatencyWindow,
}

impl DeliveryTracker {
    /// Create a tracker.
    ///
    /// `max_attempts` is clamped to `1..=MAX_ATTEMPTS_LIMIT`.
    pub fn new(timeouts: DeliveryTimeouts, max_attempts: u32, latency: LatencyWindow) -> Self {
        Self {
            in_flight: HashMap::new(),
            timeouts,
            max_attempts: max_attempts.clamp(1, MAX_ATTEMPTS_LIMIT),
            latency,
        }
    }

    /// Register a sent envelope and return its deadline.
    pub fn register(
        &mut self,
        envelope_id: EnvelopeId,
        operation: SyncOperation,
        now: Instant,
    ) -> Instant {
        let deadline = now + self.timeouts.for_priority(operation.priority);
        let attempt = operation.retry_count.saturating_add(1);
        self.in_flight.insert(
            envelope_id,
            DeliveryRecord {
                envelope_id,
                operation,
                sent_at: now,
                deadline,
                attempt,
            },
        );
        deadline
    }

    /// Confirm delivery of an envelope.
    ///
    /// Returns `None` for unknown envelopes (late ack after expiry, or after
    /// the operation was cancelled).
    pub fn ack(&mut self, envelope_id: &EnvelopeId, now: Instant) -> Option<AckedDelivery> {
        let record = self.in_flight.remove(envelope_id)?;
        let latency = now.saturating_duration_since(record.sent_at);
        self.latency.record(latency);
        Some(AckedDelivery {
            operation: record.operation,
            latency,
        })
    }

    /// Record a transient send failure for an envelope.
    pub fn fail(&mut self, envelope_id: &EnvelopeId) -> Option<FailureDecision> {
        let record = self.in_flight.remove(envelope_id)?;
        Some(self.decide(record))
    }

    /// Collect every envelope whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<FailureDecision> {
        let expired: Vec<EnvelopeId> = self
            .in_flight
            .values()
            .filter(|r| r.deadline <= now)
            .map(|r| r.envelope_id)
            .collect();

        let mut records: Vec<DeliveryRecord> = expired
            .iter()
            .filter_map(|id| self.in_flight.remove(id))
            .collect();
        records.sort_by_key(|r| r.deadline);
        records.into_iter().map(|r| self.decide(r)).collect()
    }

    /// Earliest deadline among in-flight envelopes.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(|r| r.deadline).min()
    }

    /// Drop every in-flight envelope scoped to `namespace`.
    pub fn remove_namespace(&mut self, namespace: &Namespace) -> Vec<DeliveryRecord> {
        let ids: Vec<EnvelopeId> = self
            .in_flight
            .values()
            .filter(|r| &r.operation.namespace == namespace)
            .map(|r| r.envelope_id)
            .collect();
        ids.iter()
            .filter_map(|id| self.in_flight.remove(id))
            .collect()
    }

    /// Drop the in-flight envelope carrying an operation, if any.
    pub fn remove_operation(&mut self, operation_id: &OperationId) -> Option<DeliveryRecord> {
        let envelope_id = self
            .in_flight
            .values()
            .find(|r| &r.operation.id == operation_id)
            .map(|r| r.envelope_id)?;
        self.in_flight.remove(&envelope_id)
    }

    /// In-flight operations for an entity.
    pub fn operations_for<'a>(
        &'a self,
        namespace: &'a Namespace,
        entity: &'a EntityKey,
    ) -> impl Iterator<Item = &'a SyncOperation> + 'a {
        self.in_flight
            .values()
            .map(|r| &r.operation)
            .filter(move |op| &op.namespace == namespace && &op.entity == entity)
    }

    /// Number of envelopes awaiting ack.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// The rolling latency window.
    pub fn latency(&self) -> &LatencyWindow {
        &self.latency
    }

    /// Current connection quality.
    pub fn quality(&self, reachable: bool) -> ConnectionQuality {
        self.latency.quality(reachable)
    }

    /// Maximum attempts per operation.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn decide(&self, record: DeliveryRecord) -> FailureDecision {
        let mut operation = record.operation;
        if record.attempt < self.max_attempts {
            operation.retry_count = record.attempt;
            FailureDecision::Retry(operation)
        } else {
            FailureDecision::Exhausted {
                operation,
                attempts: record.attempt,
            }
        }
    }
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new(
            DeliveryTimeouts::default(),
            DEFAULT_MAX_ATTEMPTS,
            LatencyWindow::default(),
        )
    }
}
