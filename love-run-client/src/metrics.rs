//! Lightweight Prometheus-compatible metrics for a Love Run client.
//!
//! Uses atomic counters for lock-free instrumentation. Renders metrics in
//! Prometheus text exposition format, logged on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Session activity counters for one client
pub struct Metrics {
    /// Sessions established, including re-established ones (counter)
    pub sessions_established_total: AtomicU64,
    /// Reconnection attempts started (counter)
    pub reconnect_attempts_total: AtomicU64,
    /// Successful reconnections (counter)
    pub reconnections_total: AtomicU64,
    /// Connection errors reported by the manager (counter)
    pub connection_errors_total: AtomicU64,
    /// Game-update snapshots sent to the partner (counter)
    pub game_updates_sent_total: AtomicU64,
    /// Game-update snapshots received from the partner (counter)
    pub game_updates_received_total: AtomicU64,
    /// Rounds that reached the results screen (counter)
    pub games_completed_total: AtomicU64,
    /// Client start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            sessions_established_total: AtomicU64::new(0),
            reconnect_attempts_total: AtomicU64::new(0),
            reconnections_total: AtomicU64::new(0),
            connection_errors_total: AtomicU64::new(0),
            game_updates_sent_total: AtomicU64::new(0),
            game_updates_received_total: AtomicU64::new(0),
            games_completed_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP love_run_sessions_established_total Sessions established with the partner\n\
             # TYPE love_run_sessions_established_total counter\n\
             love_run_sessions_established_total {}\n\
             # HELP love_run_reconnect_attempts_total Reconnection attempts started\n\
             # TYPE love_run_reconnect_attempts_total counter\n\
             love_run_reconnect_attempts_total {}\n\
             # HELP love_run_reconnections_total Successful reconnections\n\
             # TYPE love_run_reconnections_total counter\n\
             love_run_reconnections_total {}\n\
             # HELP love_run_connection_errors_total Connection errors reported\n\
             # TYPE love_run_connection_errors_total counter\n\
             love_run_connection_errors_total {}\n\
             # HELP love_run_game_updates_sent_total Game updates sent to the partner\n\
             # TYPE love_run_game_updates_sent_total counter\n\
             love_run_game_updates_sent_total {}\n\
             # HELP love_run_game_updates_received_total Game updates received from the partner\n\
             # TYPE love_run_game_updates_received_total counter\n\
             love_run_game_updates_received_total {}\n\
             # HELP love_run_games_completed_total Rounds completed\n\
             # TYPE love_run_games_completed_total counter\n\
             love_run_games_completed_total {}\n\
             # HELP love_run_uptime_seconds Client uptime in seconds\n\
             # TYPE love_run_uptime_seconds gauge\n\
             love_run_uptime_seconds {}\n",
            self.sessions_established_total.load(Ordering::Relaxed),
            self.reconnect_attempts_total.load(Ordering::Relaxed),
            self.reconnections_total.load(Ordering::Relaxed),
            self.connection_errors_total.load(Ordering::Relaxed),
            self.game_updates_sent_total.load(Ordering::Relaxed),
            self.game_updates_received_total.load(Ordering::Relaxed),
            self.games_completed_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
