//! Network identities, roles and room codes
//!
//! An identity is the opaque handle the rendezvous service routes to. Hosts
//! pick a human-shareable room code (`LOVE-####`) as their identity; guests
//! take whatever random identity the service assigns.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Constants
// ============================================================================

/// Prefix of every room code
pub const ROOM_CODE_PREFIX: &str = "LOVE-";

/// Number of decimal digits after the prefix
pub const ROOM_CODE_DIGITS: usize = 4;

// ============================================================================
// Identity
// ============================================================================

/// Network-reachable handle assigned by the rendezvous service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Identity(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate a room code: `LOVE-` followed by four digits (1000-9999)
    ///
    /// Collisions are not checked; codes only live as long as one session.
    pub fn room_code(random: &mut dyn RandomSource) -> Self {
        let n = 1000 + random.next_u32() % 9000;
        Identity(format!("{}{}", ROOM_CODE_PREFIX, n))
    }

    /// Generate a random identity, as assigned by a rendezvous service
    pub fn random(random: &mut dyn RandomSource) -> Self {
        let hi = random.next_u32();
        let lo = random.next_u32();
        Identity(format!("peer-{:08x}{:08x}", hi, lo))
    }

    /// Check whether this identity has the room code shape
    pub fn is_room_code(&self) -> bool {
        match self.0.strip_prefix(ROOM_CODE_PREFIX) {
            Some(digits) => {
                digits.len() == ROOM_CODE_DIGITS && digits.bytes().all(|b| b.is_ascii_digit())
            }
            None => false,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Identity(s.to_string())
    }
}

// ============================================================================
// Role & Profile
// ============================================================================

/// Which side of the game this client plays. Fixed for a logical game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Host,
    Guest,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Guest => write!(f, "guest"),
        }
    }
}

/// Display attributes of one player
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub name: String,
    pub gender: String,
    /// Host only: "real" or "phantom"
    pub player_type: Option<String>,
}

impl PlayerProfile {
    pub fn host(
        name: impl Into<String>,
        gender: impl Into<String>,
        player_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            gender: gender.into(),
            player_type: Some(player_type.into()),
        }
    }

    pub fn guest(name: impl Into<String>, gender: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gender: gender.into(),
            player_type: None,
        }
    }
}

// ============================================================================
// Randomness
// ============================================================================

/// Source of random numbers for codes, identities and jitter
pub trait RandomSource {
    fn next_u32(&mut self) -> u32;

    /// Uniform value in `[0, 1]`
    fn next_unit(&mut self) -> f64 {
        self.next_u32() as f64 / u32::MAX as f64
    }
}

/// CSPRNG-backed source
pub struct SystemRandomSource {
    rng: ring::rand::SystemRandom,
}

impl SystemRandomSource {
    pub fn new() -> Self {
        Self {
            rng: ring::rand::SystemRandom::new(),
        }
    }
}

impl Default for SystemRandomSource {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomSource for SystemRandomSource {
    fn next_u32(&mut self) -> u32 {
        use ring::rand::SecureRandom;
        let mut buf = [0u8; 4];
        if self.rng.fill(&mut buf).is_err() {
            log::warn!("SystemRandom failed, falling back to zero");
            return 0;
        }
        u32::from_ne_bytes(buf)
    }
}

/// Replays a fixed sequence of values, cycling when exhausted
pub struct SequenceRandom {
    values: Vec<u32>,
    index: usize,
}

impl SequenceRandom {
    pub fn new(values: Vec<u32>) -> Self {
        Self { values, index: 0 }
    }
}

impl RandomSource for SequenceRandom {
    fn next_u32(&mut self) -> u32 {
        if self.values.is_empty() {
            return 0;
        }
        let v = self.values[self.index % self.values.len()];
        self.index += 1;
        v
    }
}

// ============================================================================
// Invite Links
// ============================================================================

/// Build a shareable URL embedding the room code and host name as query parameters
pub fn invite_link(base_url: &str, room: &Identity, host_name: &str) -> String {
    let (base, fragment) = match base_url.split_once('#') {
        Some((b, f)) => (b, Some(f)),
        None => (base_url, None),
    };

    // Drop any existing room/host parameters before appending ours
    let (path, query) = match base.split_once('?') {
        Some((p, q)) => (p, q),
        None => (base, ""),
    };
    let mut params: Vec<&str> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .filter(|p| {
            let key = p.split('=').next().unwrap_or("");
            key != "room" && key != "host"
        })
        .collect();

    let room_param = format!("room={}", encode_component(room.as_str()));
    let host_param = format!("host={}", encode_component(host_name));
    params.push(&room_param);
    params.push(&host_param);

    let mut url = format!("{}?{}", path, params.join("&"));
    if let Some(f) = fragment {
        url.push('#');
        url.push_str(f);
    }
    url
}

/// Percent-encode a query component (form encoding, space as `+`)
fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'*' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

// ============================================================================
// Tests
// ============================================================================
