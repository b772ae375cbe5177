//! Application-facing events
//!
//! The manager reports everything through one [`EventBus`]. Any number of
//! listeners may subscribe, either to every event or to one [`EventKind`],
//! and one-shot listeners remove themselves after their first delivery.
//! Listener panics are caught and logged so they cannot leave the manager
//! half-updated.

use std::panic::{self, AssertUnwindSafe};

use crate::envelope::Envelope;
use crate::error::ConnectionError;
use crate::identity::{Identity, PlayerProfile};

// ============================================================================
// Events
// ============================================================================

/// Event delivered to the application
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Rendezvous service assigned our identity
    IdentityReady(Identity),
    /// Session open and identity exchange received from the peer
    Established {
        was_reconnect: bool,
        peer: PlayerProfile,
    },
    /// Non-control envelope from the peer
    Data(Envelope),
    /// Session is gone and will not be recovered
    Closed,
    Error(ConnectionError),
    Reconnecting { attempt: u32, max: u32 },
    Reconnected,
    ReconnectFailed,
}

/// Discriminant of a `ConnectionEvent`, used to filter listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    IdentityReady,
    Established,
    Data,
    Closed,
    Error,
    Reconnecting,
    Reconnected,
    ReconnectFailed,
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::IdentityReady(_) => EventKind::IdentityReady,
            ConnectionEvent::Established { .. } => EventKind::Established,
            ConnectionEvent::Data(_) => EventKind::Data,
            ConnectionEvent::Closed => EventKind::Closed,
            ConnectionEvent::Error(_) => EventKind::Error,
            ConnectionEvent::Reconnecting { .. } => EventKind::Reconnecting,
            ConnectionEvent::Reconnected => EventKind::Reconnected,
            ConnectionEvent::ReconnectFailed => EventKind::ReconnectFailed,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Handle returned by subscriptions, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler = Box<dyn FnMut(&ConnectionEvent)>;

struct Listener {
    id: ListenerId,
    filter: Option<EventKind>,
    once: bool,
    handler: Handler,
}

/// Multi-listener dispatcher
#[derive(Default)]
pub struct EventBus {
    listeners: Vec<Listener>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen to every event
    pub fn subscribe(&mut self, handler: impl FnMut(&ConnectionEvent) + 'static) -> ListenerId {
        self.add(None, false, Box::new(handler))
    }

    /// Listen to every event of one kind
    pub fn on(
        &mut self,
        kind: EventKind,
        handler: impl FnMut(&ConnectionEvent) + 'static,
    ) -> ListenerId {
        self.add(Some(kind), false, Box::new(handler))
    }

    /// Listen to the next event of one kind only
    pub fn once(
        &mut self,
        kind: EventKind,
        handler: impl FnMut(&ConnectionEvent) + 'static,
    ) -> ListenerId {
        self.add(Some(kind), true, Box::new(handler))
    }

    /// Remove a listener; returns whether it was still registered
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.id != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Deliver an event to every matching listener, in subscription order
    ///
    /// Returns the number of listeners that received it.
    pub fn emit(&mut self, event: &ConnectionEvent) -> usize {
        let kind = event.kind();
        let mut delivered = 0;
        let mut spent = Vec::new();

        for listener in self.listeners.iter_mut() {
            if listener.filter.is_some_and(|f| f != kind) {
                continue;
            }

            let handler = &mut listener.handler;
            if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                log::error!("Listener {:?} panicked handling {:?}", listener.id, kind);
            }
            delivered += 1;

            if listener.once {
                spent.push(listener.id);
            }
        }

        if !spent.is_empty() {
            self.listeners.retain(|l| !spent.contains(&l.id));
        }
        delivered
    }

    fn add(&mut self, filter: Option<EventKind>, once: bool, handler: Handler) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.push(Listener {
            id,
            filter,
            once,
            handler,
        });
        id
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
