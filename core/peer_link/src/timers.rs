//! Registry of named, cancellable timers
//!
//! Every deadline the manager cares about has a name. Arming a name that is
//! already armed replaces its deadline, so a superseded timer can never fire
//! against stale state. The driver asks for [`TimerRegistry::next_deadline`]
//! to decide how long to sleep and pops due timers in deadline order.

use std::collections::HashMap;
use std::time::Instant;

/// Names of the timers the connection manager schedules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    /// Rendezvous service must assign an identity before this fires
    IdentityTimeout,
    /// Guest join must produce an open session before this fires
    ConnectTimeout,
    /// Periodic keep-alive send
    KeepAlive,
    /// Periodic staleness measurement
    StalenessCheck,
    /// Follow-up after a staleness probe
    StalenessFollowUp,
    /// Delay before the next reconnection attempt
    Backoff,
    /// Guest: check the session after a re-join
    SettleCheck,
    /// Host: give up waiting for the guest to return
    HostRecoveryWait,
}

impl TimerKind {
    /// Timers that only make sense while a session is open
    pub const SESSION: [TimerKind; 3] = [
        TimerKind::KeepAlive,
        TimerKind::StalenessCheck,
        TimerKind::StalenessFollowUp,
    ];

    /// Timers owned by a reconnection attempt
    pub const RECOVERY: [TimerKind; 3] = [
        TimerKind::Backoff,
        TimerKind::SettleCheck,
        TimerKind::HostRecoveryWait,
    ];
}

/// Armed timers keyed by name
#[derive(Debug, Default)]
pub struct TimerRegistry {
    deadlines: HashMap<TimerKind, Instant>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) a timer
    pub fn arm(&mut self, kind: TimerKind, at: Instant) {
        self.deadlines.insert(kind, at);
    }

    /// Cancel a timer; returns whether it was armed
    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.deadlines.remove(&kind).is_some()
    }

    pub fn cancel_many(&mut self, kinds: &[TimerKind]) {
        for kind in kinds {
            self.deadlines.remove(kind);
        }
    }

    /// Cancel every outstanding timer
    pub fn cancel_all(&mut self) {
        self.deadlines.clear();
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return the earliest timer due at `now`
    ///
    /// Ties are broken by `TimerKind` order so firing is deterministic.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerKind> {
        let kind = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .min_by_key(|(kind, at)| (**at, **kind))
            .map(|(kind, _)| *kind)?;
        self.deadlines.remove(&kind);
        Some(kind)
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
