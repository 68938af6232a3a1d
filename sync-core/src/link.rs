//! Link state machine for Linkwise.
//!
//! This module provides a pure, side-effect-free state machine tracking
//! whether the host link is usable. The state machine takes events as input
//! and produces a new state plus a list of actions to execute.
//!
//! The actual I/O (polling reachability, sending envelopes, sleeping) is
//! performed by sync-client, not by this module.

use std::time::Duration;

use linkwise_sync_types::Priority;

/// Link state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// The transport reports the host unreachable or the session inactive.
    Unreachable,
    /// Reachable and the last send went through.
    Active,
    /// Reachable, but recent sends failed; waiting before draining again.
    Backoff {
        /// Number of consecutive failed sends so far.
        attempt: u32,
    },
}

impl LinkState {
    /// Create a new state machine in the Unreachable state.
    pub fn new() -> Self {
        Self::Unreachable
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (sync-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: LinkEvent) -> (Self, Vec<LinkAction>) {
        match (self, event) {
            // From Unreachable
            (Self::Unreachable, LinkEvent::ReachabilityChanged { reachable: true }) => (
                Self::Active,
                vec![LinkAction::Emit(LinkNotice::Reachable), LinkAction::Drain],
            ),

            // From Active
            (Self::Active, LinkEvent::ReachabilityChanged { reachable: false }) => (
                Self::Unreachable,
                vec![LinkAction::Emit(LinkNotice::Unreachable)],
            ),
            (Self::Active, LinkEvent::SendFailed { error }) => (
                Self::Backoff { attempt: 1 },
                vec![
                    LinkAction::Emit(LinkNotice::SendFailed { attempt: 1, error }),
                    LinkAction::StartBackoffTimer {
                        delay: calculate_backoff(1),
                    },
                ],
            ),

            // From Backoff
            (Self::Backoff { .. }, LinkEvent::BackoffElapsed) => {
                (Self::Active, vec![LinkAction::Drain])
            }
            (Self::Backoff { .. }, LinkEvent::SendSucceeded) => (
                Self::Active,
                vec![
                    LinkAction::CancelBackoff,
                    LinkAction::Emit(LinkNotice::Recovered),
                    LinkAction::Drain,
                ],
            ),
            (Self::Backoff { attempt }, LinkEvent::SendFailed { error }) => {
                let next_attempt = attempt.saturating_add(1);
                (
                    Self::Backoff {
                        attempt: next_attempt,
                    },
                    vec![
                        LinkAction::Emit(LinkNotice::SendFailed {
                            attempt: next_attempt,
                            error,
                        }),
                        LinkAction::StartBackoffTimer {
                            delay: calculate_backoff(next_attempt),
                        },
                    ],
                )
            }
            (Self::Backoff { .. }, LinkEvent::ReachabilityChanged { reachable: false }) => (
                Self::Unreachable,
                vec![
                    LinkAction::CancelBackoff,
                    LinkAction::Emit(LinkNotice::Unreachable),
                ],
            ),

            // Everything else leaves the state unchanged
            (state, _) => (state, vec![]),
        }
    }

    /// Whether an operation of this priority may be sent right now.
    ///
    /// Critical operations are attempted eagerly even while unreachable or
    /// backing off.
    pub fn admits(&self, priority: Priority) -> bool {
        match self {
            Self::Active => true,
            Self::Unreachable | Self::Backoff { .. } => priority == Priority::Critical,
        }
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

/// Events that can occur on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The transport's reachability/activation signal changed.
    ReachabilityChanged {
        /// Whether the host is reachable and the session active.
        reachable: bool,
    },
    /// A send completed with an ack.
    SendSucceeded,
    /// A send failed with a transient transport error.
    SendFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Backoff timer fired.
    BackoffElapsed,
}

/// Actions to be executed by the drain loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Start a timer; feed [`LinkEvent::BackoffElapsed`] when it fires.
    StartBackoffTimer {
        /// Delay before draining again.
        delay: Duration,
    },
    /// Cancel any pending backoff timer.
    CancelBackoff,
    /// Drain the queue now.
    Drain,
    /// Report a link change to observers.
    Emit(LinkNotice),
}

/// Link changes reported to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkNotice {
    /// The host became reachable.
    Reachable,
    /// The host became unreachable.
    Unreachable,
    /// A send failed and the link is backing off.
    SendFailed {
        /// Consecutive failure count.
        attempt: u32,
        /// Error message describing the failure.
        error: String,
    },
    /// A send succeeded after backing off.
    Recovered,
}

/// Calculate backoff with jitter.
///
/// Formula: min(30s, 2^attempt seconds) + random(0..5000ms)
pub fn calculate_backoff(attempt: u32) -> Duration {
    let base_secs = 2u64.pow(attempt.min(5)).min(30);
    let base = Duration::from_secs(base_secs);

    base + Duration::from_millis(random_jitter_ms())
}

/// Random jitter between 0 and 5000 milliseconds.
///
/// Falls back to zero jitter if the OS RNG is unavailable.
fn random_jitter_ms() -> u64 {
    let mut bytes = [0u8; 8];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes) % 5001,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(error: &str) -> LinkEvent {
        LinkEvent::SendFailed {
            error: error.into(),
        }
    }

    // ===========================================
    // Transitions
    // ===========================================

    #[test]
    fn starts_unreachable() {
        assert_eq!(LinkState::new(), LinkState::Unreachable);
    }

    #[test]
    fn becoming_reachable_drains() {
        let (state, actions) =
            LinkState::Unreachable.on_event(LinkEvent::ReachabilityChanged { reachable: true });

        assert_eq!(state, LinkState::Active);
        assert!(actions.contains(&LinkAction::Drain));
        assert!(actions.contains(&LinkAction::Emit(LinkNotice::Reachable)));
    }

    #[test]
    fn send_failure_starts_backoff() {
        let (state, actions) = LinkState::Active.on_event(failed("reset"));

        assert_eq!(state, LinkState::Backoff { attempt: 1 });
        assert!(actions
            .iter()
            .any(|a| matches!(a, LinkAction::StartBackoffTimer { .. })));
    }

    #[test]
    fn repeated_failure_increments_attempt() {
        let (state, actions) = LinkState::Backoff { attempt: 2 }.on_event(failed("reset"));

        assert_eq!(state, LinkState::Backoff { attempt: 3 });
        assert!(actions.iter().any(|a| matches!(
            a,
            LinkAction::Emit(LinkNotice::SendFailed { attempt: 3, .. })
        )));
    }

    #[test]
    fn backoff_elapsed_returns_to_active() {
        let (state, actions) = LinkState::Backoff { attempt: 4 }.on_event(LinkEvent::BackoffElapsed);

        assert_eq!(state, LinkState::Active);
        assert_eq!(actions, vec![LinkAction::Drain]);
    }

    #[test]
    fn success_during_backoff_recovers() {
        let (state, actions) = LinkState::Backoff { attempt: 2 }.on_event(LinkEvent::SendSucceeded);

        assert_eq!(state, LinkState::Active);
        assert!(actions.contains(&LinkAction::CancelBackoff));
        assert!(actions.contains(&LinkAction::Emit(LinkNotice::Recovered)));
    }

    #[test]
    fn losing_reachability_during_backoff_cancels_timer() {
        let (state, actions) = LinkState::Backoff { attempt: 2 }
            .on_event(LinkEvent::ReachabilityChanged { reachable: false });

        assert_eq!(state, LinkState::Unreachable);
        assert!(actions.contains(&LinkAction::CancelBackoff));
    }

    #[test]
    fn active_loses_reachability() {
        let (state, _) =
            LinkState::Active.on_event(LinkEvent::ReachabilityChanged { reachable: false });
        assert_eq!(state, LinkState::Unreachable);
    }

    #[test]
    fn irrelevant_events_are_ignored() {
        let (state, actions) = LinkState::Unreachable.on_event(failed("down"));
        assert_eq!(state, LinkState::Unreachable);
        assert!(actions.is_empty());

        let (state, actions) = LinkState::Active.on_event(LinkEvent::SendSucceeded);
        assert_eq!(state, LinkState::Active);
        assert!(actions.is_empty());
    }

    // ===========================================
    // Admission
    // ===========================================

    #[test]
    fn only_critical_passes_while_not_active() {
        for state in [LinkState::Unreachable, LinkState::Backoff { attempt: 1 }] {
            assert!(state.admits(Priority::Critical));
            assert!(!state.admits(Priority::High));
            assert!(!state.admits(Priority::Low));
        }
        assert!(LinkState::Active.admits(Priority::Low));
    }

    // ===========================================
    // Backoff
    // ===========================================

    #[test]
    fn backoff_increases_with_attempt() {
        assert!(calculate_backoff(1) >= Duration::from_secs(2));
        assert!(calculate_backoff(3) >= Duration::from_secs(8));
    }

    #[test]
    fn backoff_capped_at_30_seconds_plus_jitter() {
        let delay = calculate_backoff(10);
        assert!(delay >= Duration::from_secs(30));
        assert!(delay <= Duration::from_secs(35), "got {:?}", delay);
    }
}
