//! Priority message queue for Linkwise.
//!
//! This module provides the single ordered structure feeding the drain loop:
//! - Pop order is priority descending, then creation time ascending
//! - Non-critical resubmissions of the same entity coalesce (latest wins)
//! - Bounded capacity; overflow evicts the oldest lowest-priority entry
//! - Under aggressive power saving only critical/high entries are eligible
//!
//! The queue is not thread-safe. The drain loop owns it and every producer
//! submits through the loop's command channel.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use linkwise_sync_types::{
    EntityKey, Namespace, OperationId, OptimizationLevel, Priority, SyncOperation,
};

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 512;

/// Ordering key: higher priority first, then older first, then insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    rank: Reverse<Priority>,
    created_at: u64,
    seq: u64,
}

impl QueueKey {
    fn priority(&self) -> Priority {
        self.rank.0
    }
}

type CoalesceKey = (Namespace, EntityKey);

/// Result of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Inserted. If the queue was full, `evicted` is the entry pushed out.
    Queued {
        /// The evicted entry, if any.
        evicted: Option<SyncOperation>,
    },
    /// Merged with a queued operation for the same entity.
    ///
    /// The queued operation survives with its id, `created_at` and position.
    /// It takes the incoming payload if the incoming one is newer, and the
    /// higher of the two priorities. `superseded` is the incoming operation.
    Coalesced {
        /// The incoming operation, folded into the survivor.
        superseded: SyncOperation,
        /// The queued operation that absorbed it.
        survivor: OperationId,
    },
    /// The queue was full and the incoming operation itself was the
    /// eviction candidate.
    Rejected(SyncOperation),
}

/// Bounded priority queue with latest-wins coalescing.
#[derive(Debug)]
pub struct PriorityQueue {
    /// Maximum number of queued operations.
    capacity: usize,
    /// Monotonic insertion counter (final tie-break).
    next_seq: u64,
    /// Operations in pop order.
    entries: BTreeMap<QueueKey, SyncOperation>,
    /// Key lookup by operation id.
    by_id: HashMap<OperationId, QueueKey>,
    /// Key lookup for coalescable (non-critical) entries.
    by_entity: HashMap<CoalesceKey, QueueKey>,
}

impl PriorityQueue {
    /// Create a new queue with the given capacity (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: 0,
            entries: BTreeMap::new(),
            by_id: HashMap::new(),
            by_entity: HashMap::new(),
        }
    }

    /// Insert an operation.
    ///
    /// A non-critical operation for an entity that already has a queued
    /// non-critical operation replaces its payload in place. The payload with
    /// the newer `created_at` wins, so a retried operation never overwrites a
    /// fresher submission.
    pub fn enqueue(&mut self, op: SyncOperation) -> EnqueueOutcome {
        if op.is_coalescable() {
            let ckey = (op.namespace.clone(), op.entity.clone());
            if let Some(&existing_key) = self.by_entity.get(&ckey) {
                return self.coalesce(existing_key, ckey, op);
            }
        }

        let key = self.next_key(op.priority, op.created_at);
        self.insert(key, op);

        if self.entries.len() <= self.capacity {
            return EnqueueOutcome::Queued { evicted: None };
        }

        match self.eviction_candidate() {
            Some(victim_key) if victim_key == key => {
                let op = self.take(&victim_key).map(|(_, op)| op);
                match op {
                    Some(op) => EnqueueOutcome::Rejected(op),
                    None => EnqueueOutcome::Queued { evicted: None },
                }
            }
            Some(victim_key) => EnqueueOutcome::Queued {
                evicted: self.take(&victim_key).map(|(_, op)| op),
            },
            None => EnqueueOutcome::Queued { evicted: None },
        }
    }

    /// Pop the head if eligible at the given optimization level.
    ///
    /// Under [`OptimizationLevel::Aggressive`] only critical and high
    /// operations are eligible; the rest stay queued until the level relaxes.
    pub fn dequeue(&mut self, level: OptimizationLevel) -> Option<SyncOperation> {
        self.dequeue_at_least(eligibility_floor(level))
    }

    /// Pop the head if its priority is at least `floor`.
    pub fn dequeue_at_least(&mut self, floor: Priority) -> Option<SyncOperation> {
        let key = *self.entries.keys().next()?;
        if key.priority() < floor {
            return None;
        }
        self.take(&key).map(|(_, op)| op)
    }

    /// Peek at the head without removing it.
    pub fn peek(&self) -> Option<&SyncOperation> {
        self.entries.values().next()
    }

    /// Remove a specific operation.
    pub fn remove(&mut self, id: &OperationId) -> Option<SyncOperation> {
        let key = *self.by_id.get(id)?;
        self.take(&key).map(|(_, op)| op)
    }

    /// Queued coalescable operation for an entity, if any.
    pub fn find_entity(&self, namespace: &Namespace, entity: &EntityKey) -> Option<&SyncOperation> {
        let key = self.by_entity.get(&(namespace.clone(), entity.clone()))?;
        self.entries.get(key)
    }

    /// Remove every operation scoped to `namespace`.
    ///
    /// With `keep_critical`, critical operations stay queued.
    pub fn purge_namespace(&mut self, namespace: &Namespace, keep_critical: bool) -> Vec<SyncOperation> {
        let doomed: Vec<QueueKey> = self
            .entries
            .iter()
            .filter(|(_, op)| &op.namespace == namespace)
            .filter(|(_, op)| !(keep_critical && op.priority == Priority::Critical))
            .map(|(key, _)| *key)
            .collect();

        doomed
            .iter()
            .filter_map(|key| self.take(key).map(|(_, op)| op))
            .collect()
    }

    /// Iterate operations in pop order.
    pub fn iter(&self) -> impl Iterator<Item = &SyncOperation> {
        self.entries.values()
    }

    /// Check whether an operation is queued.
    pub fn contains(&self, id: &OperationId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of queued operations.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove everything.
    pub fn clear(&mut self) -> Vec<SyncOperation> {
        self.by_id.clear();
        self.by_entity.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    fn coalesce(
        &mut self,
        existing_key: QueueKey,
        ckey: CoalesceKey,
        incoming: SyncOperation,
    ) -> EnqueueOutcome {
        let Some((_, existing)) = self.take(&existing_key) else {
            // Index out of sync; fall back to a plain insert.
            self.by_entity.remove(&ckey);
            return self.enqueue(incoming);
        };

        // The queued entry keeps its identity and slot; only its content is
        // refreshed when the incoming submission is newer.
        let mut survivor = existing;
        if incoming.created_at >= survivor.created_at {
            survivor.payload = incoming.payload.clone();
            survivor.progress = incoming.progress;
            survivor.retry_count = incoming.retry_count;
        }
        survivor.priority = survivor.priority.max(incoming.priority);

        let key = QueueKey {
            rank: Reverse(survivor.priority),
            created_at: survivor.created_at,
            seq: existing_key.seq,
        };
        let survivor_id = survivor.id;
        self.insert(key, survivor);

        EnqueueOutcome::Coalesced {
            superseded: incoming,
            survivor: survivor_id,
        }
    }

    fn next_key(&mut self, priority: Priority, created_at: u64) -> QueueKey {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        QueueKey {
            rank: Reverse(priority),
            created_at,
            seq,
        }
    }

    fn insert(&mut self, key: QueueKey, op: SyncOperation) {
        self.by_id.insert(op.id, key);
        if op.is_coalescable() {
            self.by_entity
                .insert((op.namespace.clone(), op.entity.clone()), key);
        }
        self.entries.insert(key, op);
    }

    fn take(&mut self, key: &QueueKey) -> Option<(QueueKey, SyncOperation)> {
        let op = self.entries.remove(key)?;
        self.by_id.remove(&op.id);
        let ckey = (op.namespace.clone(), op.entity.clone());
        if self.by_entity.get(&ckey) == Some(key) {
            self.by_entity.remove(&ckey);
        }
        Some((*key, op))
    }

    /// Oldest entry among those with the lowest priority.
    fn eviction_candidate(&self) -> Option<QueueKey> {
        let lowest = self.entries.keys().next_back()?.priority();
        let start = QueueKey {
            rank: Reverse(lowest),
            created_at: 0,
            seq: 0,
        };
        self.entries.range(start..).next().map(|(key, _)| *key)
    }
}

impl Default for PriorityQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Lowest priority eligible for sending at an optimization level.
pub fn eligibility_floor(level: OptimizationLevel) -> Priority {
    match level {
        OptimizationLevel::Aggressive => Priority::High,
        OptimizationLevel::Standard | OptimizationLevel::Conservative => Priority::Low,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkwise_sync_types::EntityType;

    fn op(priority: Priority, entity_id: &str, created_at: u64) -> SyncOperation {
        SyncOperation::new(
            EntityKey::new(EntityType::Scorecard, entity_id),
            priority,
            vec![created_at as u8],
            Namespace::default(),
        )
        .with_created_at(created_at)
    }

    fn drain(queue: &mut PriorityQueue) -> Vec<SyncOperation> {
        std::iter::from_fn(|| queue.dequeue(OptimizationLevel::Standard)).collect()
    }

    // ===========================================
    // Ordering
    // ===========================================

    #[test]
    fn dequeue_orders_by_priority() {
        let mut queue = PriorityQueue::new(16);
        queue.enqueue(op(Priority::Low, "a", 1));
        queue.enqueue(op(Priority::Critical, "b", 2));
        queue.enqueue(op(Priority::High, "c", 3));

        let order: Vec<Priority> = drain(&mut queue).iter().map(|o| o.priority).collect();
        assert_eq!(order, vec![Priority::Critical, Priority::High, Priority::Low]);
    }

    #[test]
    fn ties_break_by_earliest_created_at() {
        let mut queue = PriorityQueue::new(16);
        queue.enqueue(op(Priority::Normal, "late", 30));
        queue.enqueue(op(Priority::Normal, "early", 10));
        queue.enqueue(op(Priority::Normal, "middle", 20));

        let ids: Vec<String> = drain(&mut queue)
            .into_iter()
            .map(|o| o.entity.entity_id)
            .collect();
        assert_eq!(ids, vec!["early", "middle", "late"]);
    }

    #[test]
    fn identical_timestamps_keep_insertion_order() {
        let mut queue = PriorityQueue::new(16);
        queue.enqueue(op(Priority::High, "first", 5));
        queue.enqueue(op(Priority::High, "second", 5));

        assert_eq!(queue.dequeue(OptimizationLevel::Standard).unwrap().entity.entity_id, "first");
        assert_eq!(queue.dequeue(OptimizationLevel::Standard).unwrap().entity.entity_id, "second");
    }

    #[test]
    fn arbitrary_interleavings_pop_in_order() {
        // Deterministic pseudo-random interleaving of priorities and timestamps.
        let priorities = [Priority::Low, Priority::Normal, Priority::High, Priority::Critical];
        let mut queue = PriorityQueue::new(1024);
        let mut state: u64 = 0x2545_F491_4F6C_DD1D;
        for i in 0..200 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let priority = priorities[(state % 4) as usize];
            let created_at = (state >> 8) % 50;
            queue.enqueue(op(priority, &format!("e{i}"), created_at));
        }

        let popped = drain(&mut queue);
        assert_eq!(popped.len(), 200);
        for pair in popped.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(
                a.priority > b.priority
                    || (a.priority == b.priority && a.created_at <= b.created_at),
                "out of order: {:?} then {:?}",
                a,
                b
            );
        }
    }

    // ===========================================
    // Coalescing
    // ===========================================

    #[test]
    fn non_critical_resubmission_replaces_payload_in_place() {
        let mut queue = PriorityQueue::new(16);
        let original = op(Priority::Normal, "round-1", 1);
        let original_id = original.id;
        queue.enqueue(original);
        queue.enqueue(op(Priority::Normal, "other", 2));

        let mut newer = op(Priority::Normal, "round-1", 3);
        newer.payload = b"latest".to_vec();
        newer.progress = Some(7);
        let newer_id = newer.id;
        let outcome = queue.enqueue(newer);

        match outcome {
            EnqueueOutcome::Coalesced { superseded, survivor } => {
                assert_eq!(superseded.id, newer_id);
                assert_eq!(survivor, original_id);
            }
            other => panic!("expected coalesce, got {:?}", other),
        }
        assert_eq!(queue.len(), 2);

        // Keeps the original identity and position (ahead of "other").
        let head = queue.dequeue(OptimizationLevel::Standard).unwrap();
        assert_eq!(head.id, original_id);
        assert_eq!(head.created_at, 1);
        assert_eq!(head.payload, b"latest");
        assert_eq!(head.progress, Some(7));
    }

    #[test]
    fn coalesced_entry_still_pops_in_created_at_order() {
        let mut queue = PriorityQueue::new(16);
        queue.enqueue(op(Priority::Normal, "x", 1));
        queue.enqueue(op(Priority::Normal, "y", 5));
        queue.enqueue(op(Priority::Normal, "x", 10));

        let popped = drain(&mut queue);
        let order: Vec<(&str, u64)> = popped
            .iter()
            .map(|o| (o.entity.entity_id.as_str(), o.created_at))
            .collect();
        assert_eq!(order, vec![("x", 1), ("y", 5)]);
        assert_eq!(popped[0].payload, vec![10]);
        for pair in popped.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }

    #[test]
    fn critical_resubmissions_are_retained() {
        let mut queue = PriorityQueue::new(16);
        queue.enqueue(op(Priority::Critical, "round-1", 1));
        let outcome = queue.enqueue(op(Priority::Critical, "round-1", 2));

        assert_eq!(outcome, EnqueueOutcome::Queued { evicted: None });
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn older_retry_does_not_overwrite_fresh_submission() {
        let mut queue = PriorityQueue::new(16);
        let fresh = op(Priority::High, "round-1", 50);
        let fresh_id = fresh.id;
        queue.enqueue(fresh);

        let mut retry = op(Priority::High, "round-1", 10);
        retry.retry_count = 1;
        let retry_id = retry.id;

        match queue.enqueue(retry) {
            EnqueueOutcome::Coalesced { superseded, survivor } => {
                assert_eq!(superseded.id, retry_id);
                assert_eq!(survivor, fresh_id);
            }
            other => panic!("expected coalesce, got {:?}", other),
        }
        assert_eq!(queue.len(), 1);

        let head = queue.dequeue(OptimizationLevel::Standard).unwrap();
        assert_eq!(head.payload, vec![50]);
        assert_eq!(head.retry_count, 0);
    }

    #[test]
    fn coalescing_upgrades_priority() {
        let mut queue = PriorityQueue::new(16);
        queue.enqueue(op(Priority::High, "x", 1));
        queue.enqueue(op(Priority::Low, "round-1", 2));
        queue.enqueue(op(Priority::High, "round-1", 3));

        let head = queue.dequeue(OptimizationLevel::Standard).unwrap();
        assert_eq!(head.entity.entity_id, "x");
        let next = queue.dequeue(OptimizationLevel::Standard).unwrap();
        assert_eq!(next.entity.entity_id, "round-1");
        assert_eq!(next.priority, Priority::High);
    }

    #[test]
    fn different_namespaces_do_not_coalesce() {
        let mut queue = PriorityQueue::new(16);
        queue.enqueue(op(Priority::Normal, "round-1", 1));
        let mut other = op(Priority::Normal, "round-1", 2);
        other.namespace = Namespace::new("tenant-b");
        queue.enqueue(other);

        assert_eq!(queue.len(), 2);
    }

    // ===========================================
    // Optimization level gating
    // ===========================================

    #[test]
    fn aggressive_level_holds_back_low_priority() {
        let mut queue = PriorityQueue::new(16);
        queue.enqueue(op(Priority::High, "h", 1));
        queue.enqueue(op(Priority::Normal, "n", 2));
        queue.enqueue(op(Priority::Low, "l", 3));

        assert_eq!(queue.dequeue(OptimizationLevel::Aggressive).unwrap().priority, Priority::High);
        assert!(queue.dequeue(OptimizationLevel::Aggressive).is_none());

        // Not dropped - available once the level relaxes.
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue(OptimizationLevel::Conservative).unwrap().priority, Priority::Normal);
        assert_eq!(queue.dequeue(OptimizationLevel::Standard).unwrap().priority, Priority::Low);
    }

    #[test]
    fn dequeue_at_least_critical() {
        let mut queue = PriorityQueue::new(16);
        queue.enqueue(op(Priority::High, "h", 1));
        assert!(queue.dequeue_at_least(Priority::Critical).is_none());
        queue.enqueue(op(Priority::Critical, "c", 2));
        assert_eq!(queue.dequeue_at_least(Priority::Critical).unwrap().priority, Priority::Critical);
    }

    #[test]
    fn dequeue_returns_none_when_empty() {
        let mut queue = PriorityQueue::default();
        assert!(queue.dequeue(OptimizationLevel::Standard).is_none());
        assert!(queue.peek().is_none());
    }

    // ===========================================
    // Capacity
    // ===========================================

    #[test]
    fn overflow_evicts_oldest_lowest_priority() {
        let mut queue = PriorityQueue::new(3);
        let oldest_low = op(Priority::Low, "low-1", 1);
        let oldest_low_id = oldest_low.id;
        queue.enqueue(oldest_low);
        queue.enqueue(op(Priority::Low, "low-2", 2));
        queue.enqueue(op(Priority::High, "high", 3));

        match queue.enqueue(op(Priority::Normal, "normal", 4)) {
            EnqueueOutcome::Queued { evicted: Some(victim) } => assert_eq!(victim.id, oldest_low_id),
            other => panic!("expected eviction, got {:?}", other),
        }
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn overflow_rejects_incoming_when_it_ranks_lowest() {
        let mut queue = PriorityQueue::new(2);
        queue.enqueue(op(Priority::High, "a", 1));
        queue.enqueue(op(Priority::Normal, "b", 2));

        let incoming = op(Priority::Low, "c", 3);
        let incoming_id = incoming.id;
        match queue.enqueue(incoming) {
            EnqueueOutcome::Rejected(rejected) => assert_eq!(rejected.id, incoming_id),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(queue.len(), 2);
        assert!(!queue.contains(&incoming_id));
    }

    #[test]
    fn zero_capacity_is_treated_as_one() {
        let queue = PriorityQueue::new(0);
        assert_eq!(queue.capacity(), 1);
    }

    // ===========================================
    // Removal
    // ===========================================

    #[test]
    fn remove_by_id() {
        let mut queue = PriorityQueue::new(16);
        let target = op(Priority::Normal, "t", 1);
        let id = target.id;
        queue.enqueue(target);
        queue.enqueue(op(Priority::Normal, "u", 2));

        assert_eq!(queue.remove(&id).unwrap().id, id);
        assert!(queue.remove(&id).is_none());
        assert!(queue.find_entity(&Namespace::default(), &EntityKey::new(EntityType::Scorecard, "t")).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn purge_namespace_can_spare_critical() {
        let mut queue = PriorityQueue::new(16);
        let tenant = Namespace::new("tenant-a");
        for (priority, id) in [(Priority::Critical, "c"), (Priority::Normal, "n"), (Priority::Low, "l")] {
            let mut o = op(priority, id, 1);
            o.namespace = tenant.clone();
            queue.enqueue(o);
        }
        queue.enqueue(op(Priority::Low, "elsewhere", 1));

        let purged = queue.purge_namespace(&tenant, true);
        assert_eq!(purged.len(), 2);
        assert_eq!(queue.len(), 2);

        let purged = queue.purge_namespace(&tenant, false);
        assert_eq!(purged.len(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn clear_removes_all() {
        let mut queue = PriorityQueue::new(16);
        queue.enqueue(op(Priority::Normal, "a", 1));
        queue.enqueue(op(Priority::Low, "b", 2));

        assert_eq!(queue.clear().len(), 2);
        assert!(queue.is_empty());
        // Indexes are cleared too: a resubmission is a plain insert.
        assert_eq!(
            queue.enqueue(op(Priority::Normal, "a", 3)),
            EnqueueOutcome::Queued { evicted: None }
        );
    }
}
