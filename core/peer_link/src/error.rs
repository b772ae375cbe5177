//! Error taxonomy for the session lifecycle
//!
//! Nothing here crosses the component boundary as a fault: every error is
//! delivered to the application as a `ConnectionEvent::Error` carrying a
//! human-readable message.

use std::fmt;

// ============================================================================
// Connection Errors
// ============================================================================

/// Category of a reported connection error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Identity service unreachable or did not answer in time
    SignalingUnavailable,
    /// No session within the connect bound
    ConnectionTimeout,
    /// Target identity not found or offline
    PeerUnreachable,
    /// Transient transport failure
    NetworkError,
    /// Health checks failed on an open session
    StaleConnection,
    /// Reconnection attempt budget spent
    ReconnectionExhausted,
    /// Host waited for a returning guest and none came
    ReconnectionTimeout,
}

impl ErrorKind {
    /// Whether the reconnection machine may recover from this condition
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ErrorKind::ReconnectionExhausted)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::SignalingUnavailable => write!(f, "signaling unavailable"),
            ErrorKind::ConnectionTimeout => write!(f, "connection timeout"),
            ErrorKind::PeerUnreachable => write!(f, "peer unreachable"),
            ErrorKind::NetworkError => write!(f, "network error"),
            ErrorKind::StaleConnection => write!(f, "stale connection"),
            ErrorKind::ReconnectionExhausted => write!(f, "reconnection exhausted"),
            ErrorKind::ReconnectionTimeout => write!(f, "reconnection timeout"),
        }
    }
}

/// Error reported through the application event interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ConnectionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ConnectionError {}

// ============================================================================
// Transport Errors
// ============================================================================

/// Failure codes surfaced by the signaling/transport service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorCode {
    /// Rendezvous service cannot be reached
    Unavailable,
    /// Requested identity is already registered
    IdTaken,
    /// Addressed identity is not registered
    PeerUnavailable,
    /// Link-level failure
    Network,
    /// Operation on a link or handle that no longer exists
    Closed,
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorCode::Unavailable => write!(f, "service unavailable"),
            TransportErrorCode::IdTaken => write!(f, "identity taken"),
            TransportErrorCode::PeerUnavailable => write!(f, "peer unavailable"),
            TransportErrorCode::Network => write!(f, "network failure"),
            TransportErrorCode::Closed => write!(f, "closed"),
        }
    }
}

/// Error returned by a `SignalingService` call or carried in a transport event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub code: TransportErrorCode,
    pub message: String,
}

impl TransportError {
    pub fn new(code: TransportErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Map onto the connection error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self.code {
            TransportErrorCode::Unavailable | TransportErrorCode::IdTaken => {
                ErrorKind::SignalingUnavailable
            }
            TransportErrorCode::PeerUnavailable => ErrorKind::PeerUnreachable,
            TransportErrorCode::Network | TransportErrorCode::Closed => ErrorKind::NetworkError,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for TransportError {}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        ConnectionError::new(e.kind(), e.message)
    }
}

// ============================================================================
// Tests
// ============================================================================
