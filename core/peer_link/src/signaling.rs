//! Signaling/transport service contract
//!
//! The rendezvous service and the NAT-traversal transport behind it are a
//! black box. The manager only needs the operations below; every completion
//! comes back asynchronously as a [`TransportEvent`] drained through
//! [`SignalingService::poll_event`].
//!
//! # Flow
//!
//! ```text
//! Guest                  Rendezvous                  Host
//!   │                        │◄─── create(LOVE-1234) ───│
//!   │                        │──── IdentityAssigned ───►│
//!   │─── create(None) ──────►│                          │
//!   │◄── IdentityAssigned ───│                          │
//!   │─── connect(LOVE-1234) ►│──── IncomingLink ───────►│
//!   │◄── LinkOpened ─────────│──── LinkOpened ─────────►│
//!   │◄═══════════════ LinkData (ordered, reliable) ════►│
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TransportError;
use crate::identity::Identity;

/// Transport-assigned identifier of one link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Metadata a guest attaches to its connection request
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectMetadata {
    pub name: String,
    pub gender: String,
    /// Set when this connection re-establishes an earlier session
    #[serde(default)]
    pub reconnect: bool,
}

/// Asynchronous notifications from the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// `create` completed
    IdentityAssigned(Identity),
    /// `create` failed, or the service reported an error on the handle
    SignalingFailed(TransportError),
    /// Handle dropped from the rendezvous service; existing links may survive
    Disconnected,
    /// A peer addressed our identity
    IncomingLink {
        link: LinkId,
        peer: Identity,
        metadata: ConnectMetadata,
    },
    /// Link ready for data
    LinkOpened(LinkId),
    /// One message, in send order
    LinkData(LinkId, Vec<u8>),
    /// Remote side closed the link
    LinkClosed(LinkId),
    /// Link failed
    LinkError(LinkId, TransportError),
}

/// Client side of the signaling/transport service
pub trait SignalingService {
    /// Request an identity, optionally a specific one.
    ///
    /// Any previous identity of this handle is released first. Completion is
    /// reported as `IdentityAssigned` or `SignalingFailed`; a service that is
    /// down may report nothing at all.
    fn create(&mut self, requested: Option<&Identity>) -> Result<(), TransportError>;

    /// Open a reliable, ordered link to `target`. Completion is reported as
    /// `LinkOpened` or `LinkError` for the returned id.
    fn connect(
        &mut self,
        target: &Identity,
        metadata: &ConnectMetadata,
    ) -> Result<LinkId, TransportError>;

    fn send(&mut self, link: LinkId, payload: &[u8]) -> Result<(), TransportError>;

    /// Close or refuse a link. The remote side observes `LinkClosed`.
    fn close_link(&mut self, link: LinkId);

    /// Release the identity, close every link, and drop undelivered events
    fn destroy(&mut self);

    fn poll_event(&mut self) -> Option<TransportEvent>;
}
