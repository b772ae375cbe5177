//! Tunables for the connection manager
//!
//! All durations are carried as integer milliseconds on the wire so a config
//! file reads naturally:
//!
//! ```json
//! { "keepalive_interval": 10000, "reconnect": { "max_attempts": 8, "growth": 1.5 } }
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// How long the rendezvous service may take to assign an identity
pub const IDENTITY_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a guest waits for the session to open after `join`
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Keep-alive send interval
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Staleness check cadence
pub const STALENESS_CHECK_INTERVAL: Duration = Duration::from_secs(20);

/// Silence after which the session is suspect and probed
pub const STALE_AFTER: Duration = Duration::from_secs(40);

/// Delay between the probe and the follow-up check
pub const PROBE_GRACE: Duration = Duration::from_secs(10);

/// Silence after which a suspect session is force-closed
pub const DEAD_AFTER: Duration = Duration::from_secs(50);

/// Number of round-trip samples kept for averaging
pub const RTT_WINDOW: usize = 5;

// ============================================================================
// Reconnect Policy
// ============================================================================

/// Backoff and budget for the reconnection state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first attempt
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Multiplier applied per attempt
    pub growth: f64,
    /// Upper bound of the exponential part
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Upper bound of the random component added to every delay
    #[serde(with = "duration_ms")]
    pub max_jitter: Duration,
    /// Guest: time allowed for a re-join before checking the session
    #[serde(with = "duration_ms")]
    pub settle_time: Duration,
    /// Host: time to wait for the guest to come back
    #[serde(with = "duration_ms")]
    pub host_wait: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            growth: 2.0,
            max_delay: Duration::from_secs(10),
            max_jitter: Duration::from_secs(1),
            settle_time: Duration::from_secs(5),
            host_wait: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// More attempts with gentler growth, for flaky networks
    pub fn patient() -> Self {
        Self {
            max_attempts: 8,
            growth: 1.5,
            ..Self::default()
        }
    }

    /// Deterministic part of the backoff before `attempt` (1-based):
    /// `min(base * growth^(attempt-1), max_delay)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.base_delay.as_secs_f64() * self.growth.powi(exponent);
        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Full delay: backoff plus `unit * max_jitter`, `unit` in `[0, 1]`
    pub fn delay(&self, attempt: u32, unit: f64) -> Duration {
        let unit = unit.clamp(0.0, 1.0);
        self.backoff(attempt) + self.max_jitter.mul_f64(unit)
    }
}

// ============================================================================
// Manager Config
// ============================================================================

/// Complete configuration of a `ConnectionManager`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    #[serde(with = "duration_ms")]
    pub identity_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub keepalive_interval: Duration,
    #[serde(with = "duration_ms")]
    pub staleness_check_interval: Duration,
    #[serde(with = "duration_ms")]
    pub stale_after: Duration,
    #[serde(with = "duration_ms")]
    pub probe_grace: Duration,
    #[serde(with = "duration_ms")]
    pub dead_after: Duration,
    pub rtt_window: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            identity_timeout: IDENTITY_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            staleness_check_interval: STALENESS_CHECK_INTERVAL,
            stale_after: STALE_AFTER,
            probe_grace: PROBE_GRACE,
            dead_after: DEAD_AFTER,
            rtt_window: RTT_WINDOW,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ManagerConfig {
    /// Parse and validate a JSON config; missing fields keep their defaults
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let config: ManagerConfig =
            serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the manager cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("identity_timeout", self.identity_timeout),
            ("connect_timeout", self.connect_timeout),
            ("keepalive_interval", self.keepalive_interval),
            ("staleness_check_interval", self.staleness_check_interval),
            ("stale_after", self.stale_after),
            ("probe_grace", self.probe_grace),
            ("settle_time", self.reconnect.settle_time),
            ("host_wait", self.reconnect.host_wait),
        ];
        for (field, value) in nonzero {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be non-zero", field)));
            }
        }

        if self.dead_after <= self.stale_after {
            return Err(ConfigError::Invalid(
                "dead_after must exceed stale_after".to_string(),
            ));
        }
        if self.stale_after + self.probe_grace > self.dead_after {
            return Err(ConfigError::Invalid(
                "stale_after + probe_grace must not exceed dead_after".to_string(),
            ));
        }
        if self.rtt_window == 0 {
            return Err(ConfigError::Invalid("rtt_window must be at least 1".to_string()));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.reconnect.growth.is_nan() || self.reconnect.growth < 1.0 {
            return Err(ConfigError::Invalid("growth must be >= 1.0".to_string()));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// JSON could not be parsed
    Parse(String),
    /// Values are inconsistent
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse(e) => write!(f, "config parse error: {}", e),
            ConfigError::Invalid(e) => write!(f, "invalid config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ============================================================================
// Tests
// ============================================================================
