//! Per-namespace sequence tracking for Linkwise.
//!
//! This module provides both directions of sequence bookkeeping:
//! - Assigning monotonically increasing outbound sequence numbers per namespace
//! - Recording the inbound high-water mark per namespace to reject stale updates
//!
//! Sequence 0 means "nothing yet"; the first outbound value is 1.

use std::collections::HashMap;

use linkwise_sync_types::{Namespace, SequenceNumber};

/// Tracks outbound and inbound sequence numbers per namespace.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    /// Last sequence assigned to an outbound envelope.
    outbound: HashMap<Namespace, SequenceNumber>,
    /// Highest sequence accepted from the host.
    inbound: HashMap<Namespace, SequenceNumber>,
}

impl SequenceTracker {
    /// Create a new tracker with every namespace at 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume outbound numbering for a namespace from a persisted value.
    ///
    /// Never moves a namespace backwards.
    pub fn resume(&mut self, namespace: Namespace, last_assigned: SequenceNumber) {
        let entry = self.outbound.entry(namespace).or_default();
        if last_assigned > *entry {
            *entry = last_assigned;
        }
    }

    /// Resume the inbound high-water mark for a namespace from a persisted
    /// value. Never moves a namespace backwards.
    pub fn resume_inbound(&mut self, namespace: Namespace, last_seen: SequenceNumber) {
        let entry = self.inbound.entry(namespace).or_default();
        if last_seen > *entry {
            *entry = last_seen;
        }
    }

    /// Assign the next outbound sequence number for a namespace.
    pub fn next_outbound(&mut self, namespace: &Namespace) -> SequenceNumber {
        let entry = self.outbound.entry(namespace.clone()).or_default();
        *entry = entry.next();
        *entry
    }

    /// Last outbound sequence assigned in a namespace (0 if none).
    pub fn last_outbound(&self, namespace: &Namespace) -> SequenceNumber {
        self.outbound.get(namespace).copied().unwrap_or_default()
    }

    /// Record an inbound sequence number.
    ///
    /// Returns `true` if it is newer than anything seen in that namespace,
    /// `false` if it is stale (equal or lower) and should be dropped.
    pub fn observe_inbound(&mut self, namespace: &Namespace, sequence: SequenceNumber) -> bool {
        let entry = self.inbound.entry(namespace.clone()).or_default();
        if sequence > *entry {
            *entry = sequence;
            true
        } else {
            false
        }
    }

    /// Highest inbound sequence accepted in a namespace (0 if none).
    pub fn last_inbound(&self, namespace: &Namespace) -> SequenceNumber {
        self.inbound.get(namespace).copied().unwrap_or_default()
    }
}
