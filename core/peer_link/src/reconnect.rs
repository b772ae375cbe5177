//! Reconnection state machine
//!
//! # States
//!
//! ```text
//!                 begin                backoff elapsed
//!   Idle ───────────────► Reconnecting ─────────────────► RecoveringHost
//!    ▲                        │   ▲                   └──► RecoveringGuest
//!    │ confirm                │   │ retry (attempt failed)      │
//!    ├────────────────────────┘   └─────────────────────────────┤
//!    │                                                          │
//!    └──────────────────────── confirm ─────────────────────────┘
//!
//!   any active state ── attempts > max ──► Failed (frozen until reset)
//! ```
//!
//! # Transition table
//!
//! | state            | begin    | retry    | backoff_elapsed | confirm |
//! |------------------|----------|----------|-----------------|---------|
//! | Idle             | advance  | ignored  | ignored         | ignored |
//! | Reconnecting     | ignored  | ignored  | Recovering*     | Idle    |
//! | RecoveringHost   | ignored  | advance  | ignored         | Idle    |
//! | RecoveringGuest  | ignored  | advance  | ignored         | Idle    |
//! | Failed           | ignored  | ignored  | ignored         | ignored |
//!
//! `advance` increments the attempt counter and moves to `Reconnecting`, or to
//! `Failed` once the counter exceeds the budget. `reset` returns to `Idle`
//! from anywhere.
//!
//! The machine holds no timers and performs no I/O; the manager acts on the
//! returned transitions.

use crate::config::ReconnectPolicy;
use crate::identity::Role;

/// Current phase of recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    /// No recovery in progress
    Idle,
    /// Waiting out the backoff before an attempt
    Reconnecting,
    /// Host waiting for a returning guest
    RecoveringHost,
    /// Guest re-joining the room
    RecoveringGuest,
    /// Budget spent; no further attempts
    Failed,
}

/// Result of asking the machine to start or continue recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Schedule attempt `attempt` of `max` after the backoff delay
    Schedule { attempt: u32, max: u32 },
    /// Budget exceeded, now `Failed`
    Exhausted,
    /// Call not valid in the current state
    Ignored,
}

/// Bounded reconnection counter with explicit states
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    state: ReconnectState,
    attempts: u32,
    policy: ReconnectPolicy,
}

impl ReconnectMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ReconnectState::Idle,
            attempts: 0,
            policy,
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    /// Attempts made since the last confirmed session
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Recovery under way (not idle, not failed)
    pub fn in_progress(&self) -> bool {
        matches!(
            self.state,
            ReconnectState::Reconnecting
                | ReconnectState::RecoveringHost
                | ReconnectState::RecoveringGuest
        )
    }

    pub fn is_failed(&self) -> bool {
        self.state == ReconnectState::Failed
    }

    /// Session lost; only valid from `Idle`
    pub fn begin(&mut self) -> Transition {
        match self.state {
            ReconnectState::Idle => self.advance(),
            _ => Transition::Ignored,
        }
    }

    /// The current attempt failed; schedule the next one
    pub fn retry(&mut self) -> Transition {
        match self.state {
            ReconnectState::RecoveringHost | ReconnectState::RecoveringGuest => self.advance(),
            _ => Transition::Ignored,
        }
    }

    /// Backoff done; the attempt proceeds according to role
    pub fn backoff_elapsed(&mut self, role: Role) -> Option<ReconnectState> {
        if self.state != ReconnectState::Reconnecting {
            return None;
        }
        self.state = match role {
            Role::Host => ReconnectState::RecoveringHost,
            Role::Guest => ReconnectState::RecoveringGuest,
        };
        Some(self.state)
    }

    /// A session was confirmed open after identity exchange.
    ///
    /// Resets the counter; returns whether a recovery was in progress.
    pub fn confirm(&mut self) -> bool {
        if !self.in_progress() {
            return false;
        }
        self.state = ReconnectState::Idle;
        self.attempts = 0;
        true
    }

    /// Forget everything (new game or manual close)
    pub fn reset(&mut self) {
        self.state = ReconnectState::Idle;
        self.attempts = 0;
    }

    fn advance(&mut self) -> Transition {
        self.attempts += 1;
        if self.attempts > self.policy.max_attempts {
            self.state = ReconnectState::Failed;
            return Transition::Exhausted;
        }
        self.state = ReconnectState::Reconnecting;
        Transition::Schedule {
            attempt: self.attempts,
            max: self.policy.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(max_attempts: u32) -> ReconnectMachine {
        ReconnectMachine::new(ReconnectPolicy {
            max_attempts,
            ..ReconnectPolicy::default()
        })
    }

    #[test]
    fn test_begin_only_from_idle() {
        let mut m = machine(3);
        assert_eq!(m.begin(), Transition::Schedule { attempt: 1, max: 3 });
        assert_eq!(m.state(), ReconnectState::Reconnecting);

        // Re-entrant call while reconnecting
        assert_eq!(m.begin(), Transition::Ignored);
        assert_eq!(m.attempts(), 1);
    }

    #[test]
    fn test_guest_path() {
        let mut m = machine(3);
        m.begin();
        assert_eq!(
            m.backoff_elapsed(Role::Guest),
            Some(ReconnectState::RecoveringGuest)
        );
        assert_eq!(m.backoff_elapsed(Role::Guest), None);
        assert_eq!(m.begin(), Transition::Ignored);

        assert_eq!(m.retry(), Transition::Schedule { attempt: 2, max: 3 });
        m.backoff_elapsed(Role::Guest);
        assert!(m.confirm());
        assert_eq!(m.state(), ReconnectState::Idle);
        assert_eq!(m.attempts(), 0);
    }

    #[test]
    fn test_host_path() {
        let mut m = machine(3);
        m.begin();
        assert_eq!(
            m.backoff_elapsed(Role::Host),
            Some(ReconnectState::RecoveringHost)
        );
        assert!(m.in_progress());
        assert!(m.confirm());
        assert!(!m.confirm());
    }

    #[test]
    fn test_retry_requires_recovering() {
        let mut m = machine(3);
        assert_eq!(m.retry(), Transition::Ignored);
        m.begin();
        assert_eq!(m.retry(), Transition::Ignored);
    }

    #[test]
    fn test_exhaustion_after_max_plus_one() {
        let mut m = machine(3);
        assert_eq!(m.begin(), Transition::Schedule { attempt: 1, max: 3 });
        for expected in 2..=3 {
            m.backoff_elapsed(Role::Guest);
            assert_eq!(
                m.retry(),
                Transition::Schedule {
                    attempt: expected,
                    max: 3
                }
            );
        }
        m.backoff_elapsed(Role::Guest);
        assert_eq!(m.retry(), Transition::Exhausted);
        assert!(m.is_failed());

        // Frozen
        assert_eq!(m.begin(), Transition::Ignored);
        assert_eq!(m.retry(), Transition::Ignored);
        assert!(!m.confirm());
        assert_eq!(m.attempts(), 4);

        m.reset();
        assert_eq!(m.begin(), Transition::Schedule { attempt: 1, max: 3 });
    }

    #[test]
    fn test_confirm_during_backoff() {
        let mut m = machine(3);
        m.begin();
        assert!(m.confirm());
        assert_eq!(m.begin(), Transition::Schedule { attempt: 1, max: 3 });
    }
}
