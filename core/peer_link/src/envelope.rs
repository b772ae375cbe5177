//! Session message envelopes
//!
//! Every message on a session is a JSON object whose `type` field selects the
//! payload shape:
//!
//! ```text
//! { "type": "guest-info",      "name", "gender", "reconnect" }
//! { "type": "host-info",       "name", "gender", "playerType" }
//! { "type": "ping",            "seq", "timestamp" }
//! { "type": "pong",            "seq", "timestamp", "receivedAt" }
//! { "type": "health_check",    "timestamp" }
//! { "type": "health_response", "timestamp", "respondedAt" }
//! { "type": "game-update",     "gameData": { ... } }
//! { "type": "game-results",    "results": { ... } }
//! { "type": "play-again" }
//! ```
//!
//! Objects with any other `type` are kept verbatim as
//! [`Envelope::Unrecognized`] so the application sees exactly what the peer
//! sent.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Constants
// ============================================================================

/// Maximum encoded envelope size (64 KB is far above any game message)
pub const MAX_ENVELOPE_SIZE: usize = 65536;

/// Tags with a typed payload
pub const KNOWN_TAGS: &[&str] = &[
    "guest-info",
    "host-info",
    "ping",
    "pong",
    "health_check",
    "health_response",
    "game-update",
    "game-results",
    "play-again",
];

// ============================================================================
// Payloads
// ============================================================================

/// One player's state snapshot, sent every game frame
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameData {
    pub player_x: f64,
    pub player_y: f64,
    pub score: u32,
    pub is_jumping: bool,
}

/// Final results of a round
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameResults {
    pub compatibility: u32,
    pub message: String,
    pub self_score: u32,
    pub partner_score: u32,
    pub self_name: String,
    pub partner_name: String,
}

// ============================================================================
// Envelope
// ============================================================================

/// Tagged message unit exchanged over a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Guest identity exchange, sent by the guest on open
    #[serde(rename = "guest-info")]
    GuestInfo {
        name: String,
        gender: String,
        #[serde(default)]
        reconnect: bool,
    },

    /// Host identity exchange, sent by the host on open
    #[serde(rename = "host-info")]
    HostInfo {
        name: String,
        gender: String,
        #[serde(rename = "playerType", default)]
        player_type: String,
    },

    /// Keep-alive
    #[serde(rename = "ping")]
    Ping { seq: u64, timestamp: u64 },

    /// Keep-alive echo carrying the original sequence and timestamp
    #[serde(rename = "pong")]
    Pong {
        seq: u64,
        timestamp: u64,
        #[serde(rename = "receivedAt")]
        received_at: u64,
    },

    /// Staleness probe
    #[serde(rename = "health_check")]
    HealthCheck { timestamp: u64 },

    /// Staleness probe answer
    #[serde(rename = "health_response")]
    HealthResponse {
        timestamp: u64,
        #[serde(rename = "respondedAt", default)]
        responded_at: u64,
    },

    #[serde(rename = "game-update")]
    GameUpdate {
        #[serde(rename = "gameData")]
        game_data: GameData,
    },

    #[serde(rename = "game-results")]
    GameResults { results: GameResults },

    /// Restart request
    #[serde(rename = "play-again")]
    PlayAgain,

    /// Any object with a `type` we do not model, kept as received
    #[serde(skip)]
    Unrecognized(Map<String, Value>),
}

impl Envelope {
    /// Wire tag of this envelope
    pub fn tag(&self) -> &str {
        match self {
            Envelope::GuestInfo { .. } => "guest-info",
            Envelope::HostInfo { .. } => "host-info",
            Envelope::Ping { .. } => "ping",
            Envelope::Pong { .. } => "pong",
            Envelope::HealthCheck { .. } => "health_check",
            Envelope::HealthResponse { .. } => "health_response",
            Envelope::GameUpdate { .. } => "game-update",
            Envelope::GameResults { .. } => "game-results",
            Envelope::PlayAgain => "play-again",
            Envelope::Unrecognized(map) => map.get("type").and_then(Value::as_str).unwrap_or(""),
        }
    }

    /// Keep-alive and staleness traffic, never delivered to the application
    pub fn is_health(&self) -> bool {
        matches!(
            self,
            Envelope::Ping { .. }
                | Envelope::Pong { .. }
                | Envelope::HealthCheck { .. }
                | Envelope::HealthResponse { .. }
        )
    }

    /// Convert to a JSON value
    pub fn to_value(&self) -> Result<Value, EncodeError> {
        match self {
            Envelope::Unrecognized(map) => Ok(Value::Object(map.clone())),
            _ => serde_json::to_value(self).map_err(|e| EncodeError::Serialization(e.to_string())),
        }
    }

    /// Parse a JSON value
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let map = match value {
            Value::Object(map) => map,
            _ => return Err(DecodeError::NotAnObject),
        };

        let tag = match map.get("type") {
            Some(Value::String(tag)) => tag.clone(),
            _ => return Err(DecodeError::MissingType),
        };

        if !KNOWN_TAGS.contains(&tag.as_str()) {
            return Ok(Envelope::Unrecognized(map));
        }

        serde_json::from_value(Value::Object(map)).map_err(|e| DecodeError::Malformed {
            tag,
            reason: e.to_string(),
        })
    }
}

// ============================================================================
// Encoding/Decoding
// ============================================================================

/// Encode an envelope as JSON bytes
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    let value = envelope.to_value()?;
    let buf = serde_json::to_vec(&value).map_err(|e| EncodeError::Serialization(e.to_string()))?;

    if buf.len() > MAX_ENVELOPE_SIZE {
        return Err(EncodeError::TooLarge(buf.len()));
    }

    Ok(buf)
}

/// Decode an envelope from JSON bytes
pub fn decode(buf: &[u8]) -> Result<Envelope, DecodeError> {
    if buf.len() > MAX_ENVELOPE_SIZE {
        return Err(DecodeError::TooLarge(buf.len()));
    }

    let value: Value =
        serde_json::from_slice(buf).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    Envelope::from_value(value)
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during envelope encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Serialization failed
    Serialization(String),
    /// Envelope exceeds maximum size
    TooLarge(usize),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::Serialization(e) => write!(f, "serialization error: {}", e),
            EncodeError::TooLarge(size) => {
                write!(
                    f,
                    "envelope too large: {} bytes (max {})",
                    size, MAX_ENVELOPE_SIZE
                )
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors that can occur during envelope decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not valid JSON
    InvalidJson(String),
    /// Valid JSON but not an object
    NotAnObject,
    /// Object without a string `type` field
    MissingType,
    /// Known tag with a payload that does not match its shape
    Malformed { tag: String, reason: String },
    /// Envelope exceeds maximum size
    TooLarge(usize),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::InvalidJson(e) => write!(f, "invalid json: {}", e),
            DecodeError::NotAnObject => write!(f, "envelope is not a json object"),
            DecodeError::MissingType => write!(f, "envelope has no type"),
            DecodeError::Malformed { tag, reason } => {
                write!(f, "malformed '{}' envelope: {}", tag, reason)
            }
            DecodeError::TooLarge(size) => {
                write!(
                    f,
                    "envelope too large: {} bytes (max {})",
                    size, MAX_ENVELOPE_SIZE
                )
            }
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Tests
// ============================================================================
