//! Session health monitoring
//!
//! Two independent activities run while a session is open:
//!
//! # Keep-alive
//!
//! A `ping` with a monotonically increasing sequence number and the send
//! timestamp goes out every keep-alive interval. The peer echoes it as a
//! `pong` carrying the original sequence and timestamp, from which the
//! round-trip time is computed. The last few samples are kept for averaging.
//!
//! # Staleness
//!
//! Silence is the time since *any* message was received. Once it exceeds
//! `stale_after` the session is suspect and a `health_check` probe is sent;
//! if silence still exceeds `dead_after` at the follow-up, the session is
//! declared dead.
//!
//! The monitor is pure state: the manager owns the timers and the link.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::envelope::Envelope;

/// Margin added when scheduling a check at the exact staleness crossing,
/// so the check observes silence strictly greater than the threshold
pub const CROSSING_MARGIN: Duration = Duration::from_millis(1);

/// Outcome of a periodic staleness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalenessVerdict {
    /// Recent traffic, nothing to do
    Healthy,
    /// Newly suspect: send a probe and arm the follow-up
    Probe,
    /// Already suspect, a follow-up is pending
    AwaitingProbe,
}

/// Health statistics for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStats {
    pub average_rtt: Option<Duration>,
    pub last_rtt: Option<Duration>,
    pub pings_sent: u64,
    pub pongs_received: u64,
    pub probes_sent: u64,
    pub suspect: bool,
}

/// Keep-alive and staleness state of the current session
#[derive(Debug)]
pub struct HealthMonitor {
    /// Next keep-alive sequence number to send
    next_sequence: u64,
    /// Last time any message arrived
    last_received: Option<Instant>,
    suspect: bool,
    rtt_samples: VecDeque<Duration>,
    window: usize,
    pings_sent: u64,
    pongs_received: u64,
    probes_sent: u64,
}

impl HealthMonitor {
    /// Create a monitor keeping `window` round-trip samples
    pub fn new(window: usize) -> Self {
        Self {
            next_sequence: 1,
            last_received: None,
            suspect: false,
            rtt_samples: VecDeque::with_capacity(window),
            window: window.max(1),
            pings_sent: 0,
            pongs_received: 0,
            probes_sent: 0,
        }
    }

    /// Begin monitoring a freshly opened session
    ///
    /// Sequence numbers keep increasing across sessions.
    pub fn start(&mut self, now: Instant) {
        self.last_received = Some(now);
        self.suspect = false;
        self.rtt_samples.clear();
    }

    pub fn stop(&mut self) {
        self.suspect = false;
    }

    pub fn is_suspect(&self) -> bool {
        self.suspect
    }

    /// Any inbound message defers staleness detection
    pub fn record_activity(&mut self, now: Instant) {
        self.last_received = Some(now);
    }

    /// Time since the last inbound message
    pub fn silence(&self, now: Instant) -> Duration {
        self.last_received
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Keep-alive
    // ------------------------------------------------------------------------

    /// Build the next keep-alive
    pub fn next_keepalive(&mut self, timestamp_ms: u64) -> Envelope {
        let seq = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.pings_sent += 1;
        Envelope::Ping {
            seq,
            timestamp: timestamp_ms,
        }
    }

    /// Answer a peer's keep-alive
    pub fn echo(seq: u64, timestamp: u64, received_at_ms: u64) -> Envelope {
        Envelope::Pong {
            seq,
            timestamp,
            received_at: received_at_ms,
        }
    }

    /// Record a keep-alive echo; returns the round-trip time
    ///
    /// `timestamp_ms` is our own send time echoed back, so both values are on
    /// the same clock.
    pub fn record_pong(&mut self, timestamp_ms: u64, now_ms: u64) -> Option<Duration> {
        if timestamp_ms > now_ms {
            return None;
        }
        let rtt = Duration::from_millis(now_ms - timestamp_ms);

        if self.rtt_samples.len() == self.window {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(rtt);
        self.pongs_received += 1;
        Some(rtt)
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.rtt_samples.back().copied()
    }

    /// Mean of the retained round-trip samples
    pub fn average_rtt(&self) -> Option<Duration> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        let total: Duration = self.rtt_samples.iter().sum();
        Some(total / self.rtt_samples.len() as u32)
    }

    // ------------------------------------------------------------------------
    // Staleness
    // ------------------------------------------------------------------------

    /// Periodic check; marks the session suspect once silence exceeds `stale_after`
    pub fn check_staleness(&mut self, now: Instant, stale_after: Duration) -> StalenessVerdict {
        if self.suspect {
            return StalenessVerdict::AwaitingProbe;
        }
        if self.silence(now) > stale_after {
            self.suspect = true;
            self.probes_sent += 1;
            return StalenessVerdict::Probe;
        }
        StalenessVerdict::Healthy
    }

    /// Build a staleness probe
    pub fn probe(timestamp_ms: u64) -> Envelope {
        Envelope::HealthCheck {
            timestamp: timestamp_ms,
        }
    }

    /// When the follow-up after a probe sent at `now` should run
    ///
    /// At least `probe_grace` after the probe, and never before silence
    /// crosses `dead_after`, so a silent session fails on the first follow-up.
    pub fn follow_up_at(&self, now: Instant, probe_grace: Duration, dead_after: Duration) -> Instant {
        let grace = now + probe_grace;
        match self.last_received {
            Some(last) => grace.max(last + dead_after + CROSSING_MARGIN),
            None => grace,
        }
    }

    /// Follow-up after a probe; returns true when the session is dead
    pub fn follow_up(&mut self, now: Instant, dead_after: Duration) -> bool {
        if self.silence(now) > dead_after {
            return true;
        }
        self.suspect = false;
        false
    }

    /// Probe answered
    pub fn clear_suspicion(&mut self) {
        self.suspect = false;
    }

    /// When the next periodic check should run
    ///
    /// Normally `now + interval`, pulled forward to the moment silence would
    /// cross `stale_after` so the probe always precedes `dead_after`.
    pub fn next_check_at(&self, now: Instant, interval: Duration, stale_after: Duration) -> Instant {
        let regular = now + interval;
        match self.last_received {
            Some(last) if !self.suspect => {
                let crossing = last + stale_after + CROSSING_MARGIN;
                if crossing > now {
                    regular.min(crossing)
                } else {
                    regular
                }
            }
            _ => regular,
        }
    }

    pub fn stats(&self) -> HealthStats {
        HealthStats {
            average_rtt: self.average_rtt(),
            last_rtt: self.last_rtt(),
            pings_sent: self.pings_sent,
            pongs_received: self.pongs_received,
            probes_sent: self.probes_sent,
            suspect: self.suspect,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
