//! Envelope - the unit of transmission wrapping one operation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    EntityKey, EntitySnapshot, EnvelopeId, Namespace, OperationId, Priority, SequenceNumber,
    SyncError, SyncOperation,
};

/// A queued, possibly compressed unit of transmission wrapping one operation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Envelope id (fresh per send attempt).
    pub id: EnvelopeId,
    /// The wrapped operation.
    pub operation_id: OperationId,
    /// Entity the payload updates.
    pub entity: EntityKey,
    /// Namespace the sequence number belongs to.
    pub namespace: Namespace,
    /// Priority of the wrapped operation.
    pub priority: Priority,
    /// Per-namespace sequence number.
    pub sequence: SequenceNumber,
    /// Whether `payload` is zstd-compressed.
    pub compressed: bool,
    /// Creation time of the envelope (Unix millis).
    pub created_at: u64,
    /// Retry attempt this envelope represents (0 = first send).
    pub attempt: u32,
    /// Payload bytes (compressed if `compressed`).
    pub payload: Vec<u8>,
}

impl MessageEnvelope {
    /// Wrap an operation for sending.
    pub fn wrap(
        operation: &SyncOperation,
        sequence: SequenceNumber,
        payload: Vec<u8>,
        compressed: bool,
    ) -> Self {
        Self {
            id: EnvelopeId::new(),
            operation_id: operation.id,
            entity: operation.entity.clone(),
            namespace: operation.namespace.clone(),
            priority: operation.priority,
            sequence,
            compressed,
            created_at: crate::unix_millis(),
            attempt: operation.retry_count,
            payload,
        }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }
}

impl fmt::Debug for MessageEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEnvelope")
            .field("id", &self.id)
            .field("operation_id", &self.operation_id)
            .field("entity", &self.entity)
            .field("namespace", &self.namespace)
            .field("priority", &self.priority)
            .field("sequence", &self.sequence)
            .field("compressed", &self.compressed)
            .field("attempt", &self.attempt)
            .field(
                "payload",
                &format!("[{} bytes REDACTED]", self.payload.len()),
            )
            .finish()
    }
}

/// Acknowledgement of an envelope from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// The acknowledged envelope.
    pub envelope_id: EnvelopeId,
    /// Sequence number echoed back by the host.
    pub sequence: SequenceNumber,
    /// The host's current version of the entity, when it has one.
    pub remote: Option<EntitySnapshot>,
}

impl Ack {
    /// Plain ack for an envelope.
    pub fn for_envelope(envelope: &MessageEnvelope) -> Self {
        Self {
            envelope_id: envelope.id,
            sequence: envelope.sequence,
            remote: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityType;

    fn operation() -> SyncOperation {
        SyncOperation::new(
            EntityKey::new(EntityType::Scorecard, "round-7"),
            Priority::High,
            vec![1, 2, 3, 4],
            Namespace::new("watch"),
        )
    }

    #[test]
    fn envelope_serialize_roundtrip() {
        let op = operation();
        let envelope = MessageEnvelope::wrap(&op, SequenceNumber::new(42), op.payload.clone(), false);

        let bytes = envelope.to_bytes().unwrap();
        let restored = MessageEnvelope::from_bytes(&bytes).unwrap();

        assert_eq!(envelope, restored);
    }

    #[test]
    fn wrap_carries_operation_metadata() {
        let mut op = operation();
        op.retry_count = 2;
        let envelope = MessageEnvelope::wrap(&op, SequenceNumber::new(9), vec![9], true);

        assert_eq!(envelope.operation_id, op.id);
        assert_eq!(envelope.entity, op.entity);
        assert_eq!(envelope.priority, Priority::High);
        assert_eq!(envelope.attempt, 2);
        assert!(envelope.compressed);
    }

    #[test]
    fn each_wrap_gets_a_fresh_envelope_id() {
        let op = operation();
        let a = MessageEnvelope::wrap(&op, SequenceNumber::new(1), vec![], false);
        let b = MessageEnvelope::wrap(&op, SequenceNumber::new(2), vec![], false);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let result = MessageEnvelope::from_bytes(&[0xC1, 0x00, 0x13]);
        assert!(matches!(result, Err(SyncError::Deserialization(_))));
    }

    #[test]
    fn ack_for_envelope_echoes_sequence() {
        let op = operation();
        let envelope = MessageEnvelope::wrap(&op, SequenceNumber::new(5), vec![], false);
        let ack = Ack::for_envelope(&envelope);
        assert_eq!(ack.envelope_id, envelope.id);
        assert_eq!(ack.sequence, SequenceNumber::new(5));
        assert!(ack.remote.is_none());
    }
}
