//! In-process signaling service
//!
//! A [`LoopbackHub`] plays the rendezvous service and the transport for any
//! number of [`LoopbackEndpoint`]s living in the same thread. It registers
//! identities, routes connection requests and delivers link data in order.
//!
//! Fault injection covers the failure modes the manager must survive:
//!
//! - `set_available(false)`: `create` requests are silently swallowed
//! - `partition(id)`: data to and from `id` is dropped and new connects hang
//! - `sever(id)`: every link of `id` closes on both ends
//! - `disconnect_signaling(id)`: `id` loses its registration, links survive
//!
//! An inbound link opens on the acceptor when its `IncomingLink` is polled, and
//! on the initiator only once the acceptor has polled its own `LinkOpened`
//! without closing the link first.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use crate::error::{TransportError, TransportErrorCode};
use crate::identity::{Identity, RandomSource, SystemRandomSource};
use crate::signaling::{ConnectMetadata, LinkId, SignalingService, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EndpointId(u64);

#[derive(Debug, Default)]
struct EndpointState {
    identity: Option<Identity>,
    inbox: VecDeque<TransportEvent>,
}

#[derive(Debug, Clone)]
struct LinkState {
    initiator: EndpointId,
    acceptor: EndpointId,
    initiator_identity: Identity,
    acceptor_identity: Identity,
    open: bool,
}

impl LinkState {
    fn other_end(&self, endpoint: EndpointId) -> Option<EndpointId> {
        if endpoint == self.initiator {
            Some(self.acceptor)
        } else if endpoint == self.acceptor {
            Some(self.initiator)
        } else {
            None
        }
    }

    fn involves(&self, identity: &Identity) -> bool {
        &self.initiator_identity == identity || &self.acceptor_identity == identity
    }
}

struct HubState {
    available: bool,
    next_endpoint: u64,
    next_link: u64,
    registry: HashMap<Identity, EndpointId>,
    endpoints: HashMap<EndpointId, EndpointState>,
    links: HashMap<LinkId, LinkState>,
    partitioned: HashSet<Identity>,
    random: Box<dyn RandomSource>,
}

impl HubState {
    fn push(&mut self, endpoint: EndpointId, event: TransportEvent) {
        if let Some(state) = self.endpoints.get_mut(&endpoint) {
            state.inbox.push_back(event);
        }
    }

    fn unregister(&mut self, endpoint: EndpointId) {
        if let Some(state) = self.endpoints.get_mut(&endpoint) {
            if let Some(identity) = state.identity.take() {
                self.registry.remove(&identity);
                log::debug!("Loopback: released {}", identity);
            }
        }
    }

    /// Remove a link, notifying the ends in `notify`
    fn remove_link(&mut self, link: LinkId, notify: &[EndpointId]) {
        if self.links.remove(&link).is_some() {
            for &endpoint in notify {
                self.push(endpoint, TransportEvent::LinkClosed(link));
            }
        }
    }

    fn is_partitioned(&self, link: &LinkState) -> bool {
        self.partitioned.contains(&link.initiator_identity)
            || self.partitioned.contains(&link.acceptor_identity)
    }

    fn fresh_identity(&mut self) -> Identity {
        loop {
            let candidate = Identity::random(self.random.as_mut());
            if !self.registry.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

// ============================================================================
// Hub
// ============================================================================

/// Shared rendezvous service and transport
#[derive(Clone)]
pub struct LoopbackHub {
    state: Rc<RefCell<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::with_random(Box::new(SystemRandomSource::new()))
    }

    pub fn with_random(random: Box<dyn RandomSource>) -> Self {
        Self {
            state: Rc::new(RefCell::new(HubState {
                available: true,
                next_endpoint: 0,
                next_link: 0,
                registry: HashMap::new(),
                endpoints: HashMap::new(),
                links: HashMap::new(),
                partitioned: HashSet::new(),
                random,
            })),
        }
    }

    /// New client attached to this hub
    pub fn endpoint(&self) -> LoopbackEndpoint {
        let mut hub = self.state.borrow_mut();
        hub.next_endpoint += 1;
        let id = EndpointId(hub.next_endpoint);
        hub.endpoints.insert(id, EndpointState::default());
        LoopbackEndpoint {
            id,
            hub: Rc::clone(&self.state),
        }
    }

    /// While unavailable, identity requests get no answer
    pub fn set_available(&self, available: bool) {
        self.state.borrow_mut().available = available;
    }

    pub fn partition(&self, identity: &Identity) {
        log::debug!("Loopback: partitioning {}", identity);
        self.state.borrow_mut().partitioned.insert(identity.clone());
    }

    pub fn heal(&self, identity: &Identity) {
        self.state.borrow_mut().partitioned.remove(identity);
    }

    /// Close every link of `identity`; both ends observe `LinkClosed`
    pub fn sever(&self, identity: &Identity) {
        let mut hub = self.state.borrow_mut();
        let doomed: Vec<(LinkId, EndpointId, EndpointId)> = hub
            .links
            .iter()
            .filter(|(_, l)| l.involves(identity))
            .map(|(id, l)| (*id, l.initiator, l.acceptor))
            .collect();

        for (link, initiator, acceptor) in doomed {
            log::debug!("Loopback: severing {}", link);
            hub.remove_link(link, &[initiator, acceptor]);
        }
    }

    /// Drop `identity`'s registration; its links stay up
    pub fn disconnect_signaling(&self, identity: &Identity) {
        let mut hub = self.state.borrow_mut();
        if let Some(endpoint) = hub.registry.get(identity).copied() {
            hub.unregister(endpoint);
            hub.push(endpoint, TransportEvent::Disconnected);
        }
    }

    pub fn is_registered(&self, identity: &Identity) -> bool {
        self.state.borrow().registry.contains_key(identity)
    }

    pub fn link_count(&self) -> usize {
        self.state.borrow().links.len()
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// One client's handle on the hub
pub struct LoopbackEndpoint {
    id: EndpointId,
    hub: Rc<RefCell<HubState>>,
}

impl LoopbackEndpoint {
    /// Identity currently registered for this endpoint
    pub fn identity(&self) -> Option<Identity> {
        self.hub
            .borrow()
            .endpoints
            .get(&self.id)
            .and_then(|s| s.identity.clone())
    }
}

impl SignalingService for LoopbackEndpoint {
    fn create(&mut self, requested: Option<&Identity>) -> Result<(), TransportError> {
        let mut hub = self.hub.borrow_mut();
        hub.unregister(self.id);

        if !hub.available {
            log::debug!("Loopback: swallowing create while unavailable");
            return Ok(());
        }

        let identity = match requested {
            Some(id) if hub.registry.contains_key(id) => {
                hub.push(
                    self.id,
                    TransportEvent::SignalingFailed(TransportError::new(
                        TransportErrorCode::IdTaken,
                        format!("ID \"{}\" is taken", id),
                    )),
                );
                return Ok(());
            }
            Some(id) => id.clone(),
            None => hub.fresh_identity(),
        };

        hub.registry.insert(identity.clone(), self.id);
        if let Some(state) = hub.endpoints.get_mut(&self.id) {
            state.identity = Some(identity.clone());
        }
        hub.push(self.id, TransportEvent::IdentityAssigned(identity));
        Ok(())
    }

    fn connect(
        &mut self,
        target: &Identity,
        metadata: &ConnectMetadata,
    ) -> Result<LinkId, TransportError> {
        let mut hub = self.hub.borrow_mut();

        let own = hub
            .endpoints
            .get(&self.id)
            .and_then(|s| s.identity.clone())
            .ok_or_else(|| {
                TransportError::new(TransportErrorCode::Unavailable, "no identity to connect from")
            })?;

        hub.next_link += 1;
        let link = LinkId(hub.next_link);

        let acceptor = match hub.registry.get(target).copied() {
            Some(acceptor) => acceptor,
            None => {
                hub.push(
                    self.id,
                    TransportEvent::LinkError(
                        link,
                        TransportError::new(
                            TransportErrorCode::PeerUnavailable,
                            format!("Could not connect to peer {}", target),
                        ),
                    ),
                );
                return Ok(link);
            }
        };

        let state = LinkState {
            initiator: self.id,
            acceptor,
            initiator_identity: own.clone(),
            acceptor_identity: target.clone(),
            open: false,
        };
        let hang = hub.is_partitioned(&state);
        hub.links.insert(link, state);

        if hang {
            log::debug!("Loopback: {} to {} hangs behind a partition", link, target);
            return Ok(link);
        }

        hub.push(
            acceptor,
            TransportEvent::IncomingLink {
                link,
                peer: own,
                metadata: metadata.clone(),
            },
        );
        Ok(link)
    }

    fn send(&mut self, link: LinkId, payload: &[u8]) -> Result<(), TransportError> {
        let mut hub = self.hub.borrow_mut();
        let state = hub.links.get(&link).cloned().ok_or_else(|| {
            TransportError::new(TransportErrorCode::Closed, format!("{} is closed", link))
        })?;
        let other = state
            .other_end(self.id)
            .ok_or_else(|| TransportError::new(TransportErrorCode::Closed, "not an end of link"))?;

        if hub.is_partitioned(&state) {
            log::trace!("Loopback: dropping {} bytes on partitioned {}", payload.len(), link);
            return Ok(());
        }

        hub.push(other, TransportEvent::LinkData(link, payload.to_vec()));
        Ok(())
    }

    fn close_link(&mut self, link: LinkId) {
        let mut hub = self.hub.borrow_mut();
        let other = match hub.links.get(&link).and_then(|l| l.other_end(self.id)) {
            Some(other) => other,
            None => return,
        };
        hub.remove_link(link, &[other]);
    }

    fn destroy(&mut self) {
        let mut hub = self.hub.borrow_mut();
        hub.unregister(self.id);

        let own: Vec<(LinkId, EndpointId)> = hub
            .links
            .iter()
            .filter_map(|(id, l)| l.other_end(self.id).map(|other| (*id, other)))
            .collect();
        for (link, other) in own {
            hub.remove_link(link, &[other]);
        }

        if let Some(state) = hub.endpoints.get_mut(&self.id) {
            state.inbox.clear();
        }
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        let mut hub = self.hub.borrow_mut();
        loop {
            let event = hub.endpoints.get_mut(&self.id)?.inbox.pop_front()?;

            match &event {
                TransportEvent::IncomingLink { link, .. } => {
                    if !hub.links.contains_key(link) {
                        continue;
                    }
                    hub.push(self.id, TransportEvent::LinkOpened(*link));
                }
                TransportEvent::LinkOpened(link) => {
                    let initiator = match hub.links.get_mut(link) {
                        None => continue,
                        Some(state) if state.acceptor == self.id && !state.open => {
                            state.open = true;
                            Some(state.initiator)
                        }
                        Some(_) => None,
                    };
                    if let Some(initiator) = initiator {
                        hub.push(initiator, TransportEvent::LinkOpened(*link));
                    }
                }
                _ => {}
            }
            return Some(event);
        }
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        self.destroy();
        self.hub.borrow_mut().endpoints.remove(&self.id);
    }
}

// ============================================================================
// Tests
// ============================================================================
