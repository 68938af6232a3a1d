//! Deterministic conflict resolution between two versions of one entity.
//!
//! Rules, applied in order:
//! 1. Strictly greater progress wins (only when both sides carry progress).
//! 2. Otherwise the more recent `updated_at` wins.
//! 3. Otherwise the remote side wins.
//!
//! Snapshots for different entities cannot be compared and resolve to the
//! remote side directly.

use linkwise_sync_types::EntitySnapshot;

/// Which side won.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The device's pending or cached version.
    Local,
    /// The host's version.
    Remote,
}

/// Which rule decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionRule {
    /// Greater progress metric.
    Progress,
    /// More recent update time.
    Timestamp,
    /// Tie or incomparable; remote is the source of record.
    Fallback,
}

/// Outcome of [`resolve_conflict`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The winning side.
    pub winner: Side,
    /// The rule that decided.
    pub rule: ResolutionRule,
    /// The winning snapshot.
    pub snapshot: EntitySnapshot,
}

impl Resolution {
    /// Whether the deterministic tie-break was used.
    pub fn is_fallback(&self) -> bool {
        self.rule == ResolutionRule::Fallback
    }
}

/// Reconcile a local and a remote version of the same entity.
///
/// Pure and idempotent: resolving the winner against the same remote again
/// yields the same winner.
pub fn resolve_conflict(local: &EntitySnapshot, remote: &EntitySnapshot) -> Resolution {
    let (winner, rule) = decide(local, remote);
    let snapshot = match winner {
        Side::Local => local.clone(),
        Side::Remote => remote.clone(),
    };
    Resolution {
        winner,
        rule,
        snapshot,
    }
}

fn decide(local: &EntitySnapshot, remote: &EntitySnapshot) -> (Side, ResolutionRule) {
    if local.key != remote.key {
        return (Side::Remote, ResolutionRule::Fallback);
    }

    if let (Some(l), Some(r)) = (local.progress, remote.progress) {
        if l != r {
            let side = if l > r { Side::Local } else { Side::Remote };
            return (side, ResolutionRule::Progress);
        }
    }

    if local.updated_at != remote.updated_at {
        let side = if local.updated_at > remote.updated_at {
            Side::Local
        } else {
            Side::Remote
        };
        return (side, ResolutionRule::Timestamp);
    }

    (Side::Remote, ResolutionRule::Fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkwise_sync_types::{EntityKey, EntityType};

    fn snap(progress: Option<u64>, updated_at: u64, tag: u8) -> EntitySnapshot {
        EntitySnapshot::new(
            EntityKey::new(EntityType::ActiveRound, "round-1"),
            progress,
            updated_at,
            vec![tag],
        )
    }

    // ===========================================
    // Rules
    // ===========================================

    #[test]
    fn greater_progress_wins_over_newer_timestamp() {
        let local = snap(Some(7), 100, 1);
        let remote = snap(Some(6), 900, 2);

        let resolution = resolve_conflict(&local, &remote);
        assert_eq!(resolution.winner, Side::Local);
        assert_eq!(resolution.rule, ResolutionRule::Progress);
        assert_eq!(resolution.snapshot, local);
    }

    #[test]
    fn equal_progress_falls_through_to_timestamp() {
        let local = snap(Some(4), 100, 1);
        let remote = snap(Some(4), 200, 2);

        let resolution = resolve_conflict(&local, &remote);
        assert_eq!(resolution.winner, Side::Remote);
        assert_eq!(resolution.rule, ResolutionRule::Timestamp);
    }

    #[test]
    fn missing_progress_uses_timestamp() {
        let local = snap(None, 500, 1);
        let remote = snap(Some(9), 100, 2);

        let resolution = resolve_conflict(&local, &remote);
        assert_eq!(resolution.winner, Side::Local);
        assert_eq!(resolution.rule, ResolutionRule::Timestamp);
    }

    #[test]
    fn full_tie_prefers_remote() {
        let local = snap(Some(3), 100, 1);
        let remote = snap(Some(3), 100, 2);

        let resolution = resolve_conflict(&local, &remote);
        assert_eq!(resolution.winner, Side::Remote);
        assert!(resolution.is_fallback());
        assert_eq!(resolution.snapshot.payload, vec![2]);
    }

    #[test]
    fn different_entities_fall_back_to_remote() {
        let local = snap(Some(9), 900, 1);
        let remote = EntitySnapshot::new(
            EntityKey::new(EntityType::ActiveRound, "round-2"),
            Some(1),
            1,
            vec![2],
        );

        let resolution = resolve_conflict(&local, &remote);
        assert_eq!(resolution.winner, Side::Remote);
        assert!(resolution.is_fallback());
    }

    // ===========================================
    // Idempotence
    // ===========================================

    #[test]
    fn resolving_twice_is_stable() {
        let progresses = [None, Some(0), Some(3), Some(7)];
        let timestamps = [0u64, 100, 200];

        for lp in progresses {
            for rp in progresses {
                for lt in timestamps {
                    for rt in timestamps {
                        let local = snap(lp, lt, 1);
                        let remote = snap(rp, rt, 2);

                        let once = resolve_conflict(&local, &remote);
                        let twice = resolve_conflict(&once.snapshot, &remote);
                        assert_eq!(
                            once.snapshot, twice.snapshot,
                            "not idempotent for local={:?} remote={:?}",
                            local, remote
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn resolution_is_deterministic() {
        let local = snap(Some(2), 300, 1);
        let remote = snap(Some(2), 250, 2);
        assert_eq!(resolve_conflict(&local, &remote), resolve_conflict(&local, &remote));
    }
}
