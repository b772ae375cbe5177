//! Peer Link
//!
//! Connection lifecycle core for two-player peer sessions:
//! - Room codes and identity acquisition through a rendezvous service
//! - Identity exchange and typed message envelopes
//! - Keep-alive round trips and staleness detection
//! - Bounded, role-aware reconnection
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      Peer Link Structure                       │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  manager.rs    - Session lifecycle, owns everything below      │
//! │  signaling.rs  - Rendezvous/transport service contract         │
//! │  loopback.rs   - In-process service with fault injection       │
//! │  envelope.rs   - Wire envelopes (JSON)                         │
//! │  health.rs     - Keep-alive and staleness state                │
//! │  reconnect.rs  - Reconnection state machine                    │
//! │  timers.rs     - Named deadlines                               │
//! │  events.rs     - Application event bus                         │
//! │                                                                │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The manager is driven by the caller: call [`ConnectionManager::poll`]
//! whenever the service may have produced events or
//! [`ConnectionManager::next_deadline`] has passed.

pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod health;
pub mod identity;
pub mod loopback;
pub mod manager;
pub mod reconnect;
pub mod signaling;
pub mod timers;

// Re-export commonly used types
pub use config::{ConfigError, ManagerConfig, ReconnectPolicy};
pub use envelope::{decode, encode, DecodeError, EncodeError, Envelope, GameData, GameResults};
pub use error::{ConnectionError, ErrorKind, TransportError, TransportErrorCode};
pub use events::{ConnectionEvent, EventBus, EventKind, ListenerId};
pub use health::HealthStats;
pub use identity::{
    invite_link, Identity, PlayerProfile, RandomSource, Role, SequenceRandom, SystemRandomSource,
};
pub use loopback::{LoopbackEndpoint, LoopbackHub};
pub use manager::ConnectionManager;
pub use reconnect::ReconnectState;
pub use signaling::{ConnectMetadata, LinkId, SignalingService, TransportEvent};
