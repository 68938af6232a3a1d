//! Operations - typed, prioritized units of domain-state change.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{unix_millis, Namespace, OperationId, SyncError};

/// The kind of domain entity an operation updates.
///
/// Also used as the update category for power-aware scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Course layout and hole data.
    Course,
    /// The round currently being played.
    ActiveRound,
    /// Per-hole scores.
    Scorecard,
    /// Health summaries (heart rate, steps, energy).
    HealthMetrics,
    /// Live standings.
    Leaderboard,
    /// Tournament metadata.
    Tournament,
    /// Course/round ratings.
    Rating,
    /// Connectivity heartbeat.
    Heartbeat,
}

impl EntityType {
    /// Every entity type, in declaration order.
    pub const ALL: [EntityType; 8] = [
        EntityType::Course,
        EntityType::ActiveRound,
        EntityType::Scorecard,
        EntityType::HealthMetrics,
        EntityType::Leaderboard,
        EntityType::Tournament,
        EntityType::Rating,
        EntityType::Heartbeat,
    ];

    /// Stable snake_case name, used in storage keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Course => "course",
            EntityType::ActiveRound => "active_round",
            EntityType::Scorecard => "scorecard",
            EntityType::HealthMetrics => "health_metrics",
            EntityType::Leaderboard => "leaderboard",
            EntityType::Tournament => "tournament",
            EntityType::Rating => "rating",
            EntityType::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SyncError::InvalidData(format!("unknown entity type: {s}")))
    }
}

/// Delivery priority. Ordering is `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background data; first to be evicted.
    Low = 0,
    /// Regular updates.
    #[default]
    Normal = 1,
    /// User-visible updates.
    High = 2,
    /// Must not be lost; never coalesced, sent even while backing off.
    Critical = 3,
}

impl Priority {
    /// Default ack deadline for an envelope of this priority.
    pub fn default_ack_timeout(&self) -> Duration {
        match self {
            Priority::Critical => Duration::from_secs(5),
            Priority::High => Duration::from_secs(10),
            Priority::Normal => Duration::from_secs(15),
            Priority::Low => Duration::from_secs(30),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(name)
    }
}

impl FromStr for Priority {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(SyncError::InvalidData(format!("unknown priority: {other}"))),
        }
    }
}

/// Identifies one logical entity: its type plus a domain id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// The entity type.
    pub entity_type: EntityType,
    /// Domain identifier (round id, course id, ...).
    pub entity_id: String,
}

impl EntityKey {
    /// Create a new entity key.
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// A typed, prioritized unit of domain-state change awaiting delivery.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Unique operation id.
    pub id: OperationId,
    /// The logical entity this operation updates.
    pub entity: EntityKey,
    /// Delivery priority.
    pub priority: Priority,
    /// Encoded domain payload.
    pub payload: Vec<u8>,
    /// Creation time (Unix millis).
    pub created_at: u64,
    /// Number of retries so far (0 on first send).
    pub retry_count: u32,
    /// Peer/tenant context this operation is scoped to.
    pub namespace: Namespace,
    /// Progress metric for multi-stage entities (e.g. hole number), used for
    /// conflict resolution.
    pub progress: Option<u64>,
}

impl SyncOperation {
    /// Create a new operation stamped with the current time.
    pub fn new(
        entity: EntityKey,
        priority: Priority,
        payload: Vec<u8>,
        namespace: Namespace,
    ) -> Self {
        Self {
            id: OperationId::new(),
            entity,
            priority,
            payload,
            created_at: unix_millis(),
            retry_count: 0,
            namespace,
            progress: None,
        }
    }

    /// Attach a progress metric.
    pub fn with_progress(mut self, progress: u64) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Override the creation timestamp.
    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Whether resubmissions of the same entity may replace this one in place.
    ///
    /// Critical operations are never coalesced.
    pub fn is_coalescable(&self) -> bool {
        self.priority != Priority::Critical
    }
}

impl fmt::Debug for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOperation")
            .field("id", &self.id)
            .field("entity", &self.entity)
            .field("priority", &self.priority)
            .field(
                "payload",
                &format!("[{} bytes REDACTED]", self.payload.len()),
            )
            .field("created_at", &self.created_at)
            .field("retry_count", &self.retry_count)
            .field("namespace", &self.namespace)
            .field("progress", &self.progress)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn ack_timeouts_match_priority() {
        assert_eq!(Priority::Critical.default_ack_timeout(), Duration::from_secs(5));
        assert_eq!(Priority::High.default_ack_timeout(), Duration::from_secs(10));
        assert_eq!(Priority::Normal.default_ack_timeout(), Duration::from_secs(15));
        assert_eq!(Priority::Low.default_ack_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn entity_type_parses_its_own_name() {
        for t in EntityType::ALL {
            assert_eq!(t.as_str().parse::<EntityType>().unwrap(), t);
        }
        assert!("putter".parse::<EntityType>().is_err());
    }

    #[test]
    fn priority_parses() {
        assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Critical);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn critical_operations_are_not_coalescable() {
        let key = EntityKey::new(EntityType::Scorecard, "round-1");
        let op = SyncOperation::new(key.clone(), Priority::Critical, vec![], Namespace::default());
        assert!(!op.is_coalescable());
        let op = SyncOperation::new(key, Priority::High, vec![], Namespace::default());
        assert!(op.is_coalescable());
    }

    #[test]
    fn entity_key_display() {
        let key = EntityKey::new(EntityType::ActiveRound, "r-42");
        assert_eq!(key.to_string(), "active_round:r-42");
    }

    #[test]
    fn entity_type_serializes_snake_case() {
        let json = serde_json::to_string(&EntityType::HealthMetrics).unwrap();
        assert_eq!(json, "\"health_metrics\"");
    }

    #[test]
    fn operation_debug_redacts_payload() {
        let op = SyncOperation::new(
            EntityKey::new(EntityType::HealthMetrics, "today"),
            Priority::Low,
            vec![0xDE, 0xAD, 0xBE, 0xEF],
            Namespace::default(),
        );
        let debug = format!("{:?}", op);
        assert!(debug.contains("[4 bytes REDACTED]"));
        assert!(!debug.contains("222"), "payload bytes must not appear");
    }
}
