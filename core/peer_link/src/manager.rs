//! Connection lifecycle manager
//!
//! Owns the single session of this client and drives it through setup,
//! health monitoring and recovery:
//!
//! ```text
//! host()/join() ──► identity ──► link ──► open ──► identity exchange ──► paired
//!                                            │                              │
//!                                            └── closed / error / stale ◄───┘
//!                                                        │
//!                                              reconnection machine
//! ```
//!
//! The manager is sans-IO. It never reads the clock or blocks: every entry
//! point takes `now`, transport completions arrive through
//! [`ConnectionManager::poll`], and every deadline lives in one
//! [`TimerRegistry`]. Results reach the application through the
//! [`EventBus`].

use std::time::{Duration, Instant};

use crate::config::ManagerConfig;
use crate::envelope::{self, Envelope, GameData, GameResults};
use crate::error::{ConnectionError, ErrorKind, TransportError};
use crate::events::{ConnectionEvent, EventBus, EventKind, ListenerId};
use crate::health::{HealthMonitor, HealthStats, StalenessVerdict};
use crate::identity::{invite_link, Identity, PlayerProfile, RandomSource, Role, SystemRandomSource};
use crate::reconnect::{ReconnectMachine, ReconnectState, Transition};
use crate::signaling::{ConnectMetadata, LinkId, SignalingService, TransportEvent};
use crate::timers::{TimerKind, TimerRegistry};

// ============================================================================
// Internal State
// ============================================================================

/// The one logical connection to the peer
#[derive(Debug, Clone)]
struct Session {
    link: LinkId,
    peer: Identity,
    open: bool,
    /// Peer's identity-exchange envelope received
    exchanged: bool,
}

impl Session {
    fn new(link: LinkId, peer: Identity) -> Self {
        Self {
            link,
            peer,
            open: false,
            exchanged: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum IdentityState {
    Absent,
    Pending,
    Ready(Identity),
}

/// What to do once the pending identity is assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterIdentity {
    /// Guest: address the room
    Connect { reconnect: bool },
    /// Host: wait for the guest to return
    AwaitGuest,
}

// ============================================================================
// Connection Manager
// ============================================================================

/// Lifecycle manager for one peer session
pub struct ConnectionManager<S: SignalingService> {
    service: S,
    config: ManagerConfig,
    random: Box<dyn RandomSource>,
    role: Option<Role>,
    room: Option<Identity>,
    local: Option<PlayerProfile>,
    peer: Option<PlayerProfile>,
    identity: IdentityState,
    /// Current identity has addressed a peer and cannot be reused for a join
    identity_used: bool,
    after_identity: Option<AfterIdentity>,
    session: Option<Session>,
    manual_disconnect: bool,
    timers: TimerRegistry,
    health: HealthMonitor,
    reconnect: ReconnectMachine,
    events: EventBus,
    /// Origin of wire timestamps
    epoch: Instant,
}

impl<S: SignalingService> ConnectionManager<S> {
    pub fn new(service: S, config: ManagerConfig) -> Self {
        Self::with_random(service, config, Box::new(SystemRandomSource::new()))
    }

    pub fn with_random(service: S, config: ManagerConfig, random: Box<dyn RandomSource>) -> Self {
        let health = HealthMonitor::new(config.rtt_window);
        let reconnect = ReconnectMachine::new(config.reconnect.clone());
        Self {
            service,
            config,
            random,
            role: None,
            room: None,
            local: None,
            peer: None,
            identity: IdentityState::Absent,
            identity_used: false,
            after_identity: None,
            session: None,
            manual_disconnect: false,
            timers: TimerRegistry::new(),
            health,
            reconnect,
            events: EventBus::new(),
            epoch: Instant::now(),
        }
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    pub fn subscribe(&mut self, handler: impl FnMut(&ConnectionEvent) + 'static) -> ListenerId {
        self.events.subscribe(handler)
    }

    pub fn on(
        &mut self,
        kind: EventKind,
        handler: impl FnMut(&ConnectionEvent) + 'static,
    ) -> ListenerId {
        self.events.on(kind, handler)
    }

    pub fn once(
        &mut self,
        kind: EventKind,
        handler: impl FnMut(&ConnectionEvent) + 'static,
    ) -> ListenerId {
        self.events.once(kind, handler)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.events.unsubscribe(id)
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Acquire a network identity, optionally a specific one.
    ///
    /// Completion is reported as `IdentityReady`; a rendezvous service that does
    /// not answer within the identity timeout is reported as `SignalingUnavailable`.
    ///
    /// Refused while a session is open or being recovered; `close` it first.
    pub fn initialize(&mut self, requested: Option<Identity>, now: Instant) {
        if self.session.is_some() || self.reconnect.in_progress() {
            log::warn!("Ignoring initialize while a session is active");
            return;
        }
        self.after_identity = None;
        self.acquire_identity(requested, now);
    }

    /// Create a room and wait for a guest. Returns the room code.
    pub fn host(&mut self, profile: PlayerProfile, now: Instant) -> Identity {
        self.reset_for_new_game();
        self.role = Some(Role::Host);
        self.local = Some(profile);

        let room = Identity::room_code(self.random.as_mut());
        log::info!("Hosting room {}", room);
        self.room = Some(room.clone());

        self.after_identity = None;
        self.acquire_identity(Some(room.clone()), now);
        room
    }

    /// Join the room hosted at `room`
    pub fn join(&mut self, room: Identity, profile: PlayerProfile, now: Instant) {
        self.reset_for_new_game();
        self.role = Some(Role::Guest);
        self.local = Some(profile);

        log::info!("Joining room {}", room);
        self.room = Some(room);

        self.timers
            .arm(TimerKind::ConnectTimeout, now + self.config.connect_timeout);
        self.start_join(false, now);
    }

    /// Send an envelope on the open session.
    ///
    /// Returns false, doing nothing, when no session is open.
    pub fn send(&mut self, envelope: &Envelope) -> bool {
        let link = match &self.session {
            Some(session) if session.open => session.link,
            _ => {
                log::debug!("Cannot send {}: connection not established", envelope.tag());
                return false;
            }
        };

        let bytes = match envelope::encode(envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Cannot send {}: {}", envelope.tag(), e);
                return false;
            }
        };

        match self.service.send(link, &bytes) {
            Ok(()) => {
                log::trace!("Sent {} on {}", envelope.tag(), link);
                true
            }
            Err(e) => {
                log::warn!("Send of {} on {} failed: {}", envelope.tag(), link, e);
                false
            }
        }
    }

    pub fn send_game_update(&mut self, game_data: GameData) -> bool {
        self.send(&Envelope::GameUpdate { game_data })
    }

    pub fn send_game_results(&mut self, results: GameResults) -> bool {
        self.send(&Envelope::GameResults { results })
    }

    pub fn send_play_again(&mut self) -> bool {
        self.send(&Envelope::PlayAgain)
    }

    /// Tear everything down and suppress reconnection. Idempotent.
    pub fn close(&mut self) {
        let had_session = self.session.is_some();
        let was_recovering = self.reconnect.in_progress();
        let had_identity = self.identity != IdentityState::Absent;

        self.manual_disconnect = true;
        self.timers.cancel_all();
        self.health.stop();
        self.after_identity = None;
        self.reconnect.reset();

        if let Some(session) = self.session.take() {
            self.service.close_link(session.link);
        }
        if had_identity {
            self.service.destroy();
        }
        self.identity = IdentityState::Absent;
        self.identity_used = false;

        if had_session || was_recovering || had_identity {
            log::info!("Connection resources cleaned up");
        }
        if had_session || was_recovering {
            self.emit(ConnectionEvent::Closed);
        }
    }

    /// Process pending transport events, then every timer due at `now`
    pub fn poll(&mut self, now: Instant) {
        while let Some(event) = self.service.poll_event() {
            self.handle_transport_event(event, now);
        }
        while let Some(timer) = self.timers.pop_due(now) {
            self.handle_timer(timer, now);
        }
    }

    /// Earliest instant at which `poll` has timer work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.open)
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn room(&self) -> Option<&Identity> {
        self.room.as_ref()
    }

    /// Our assigned identity, once ready
    pub fn identity(&self) -> Option<&Identity> {
        match &self.identity {
            IdentityState::Ready(id) => Some(id),
            _ => None,
        }
    }

    /// Identity of the peer on the current session
    pub fn session_peer(&self) -> Option<&Identity> {
        self.session.as_ref().map(|s| &s.peer)
    }

    pub fn local_profile(&self) -> Option<&PlayerProfile> {
        self.local.as_ref()
    }

    pub fn partner(&self) -> Option<&PlayerProfile> {
        self.peer.as_ref()
    }

    pub fn partner_name(&self) -> Option<&str> {
        self.peer.as_ref().map(|p| p.name.as_str())
    }

    pub fn partner_gender(&self) -> Option<&str> {
        self.peer.as_ref().map(|p| p.gender.as_str())
    }

    /// Player type chosen by the host, seen from either side
    pub fn host_player_type(&self) -> Option<&str> {
        let host = match self.role? {
            Role::Host => self.local.as_ref(),
            Role::Guest => self.peer.as_ref(),
        };
        host.and_then(|p| p.player_type.as_deref())
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect.attempts()
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        self.reconnect.state()
    }

    pub fn is_manually_disconnected(&self) -> bool {
        self.manual_disconnect
    }

    pub fn health_stats(&self) -> HealthStats {
        self.health.stats()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut S {
        &mut self.service
    }

    /// Link to share with the partner: room code plus host name
    pub fn shareable_link(&self, base_url: &str) -> Option<String> {
        let room = self.room.as_ref()?;
        let host_name = match self.role? {
            Role::Host => self.local.as_ref()?.name.as_str(),
            Role::Guest => self.peer.as_ref().map(|p| p.name.as_str()).unwrap_or(""),
        };
        Some(invite_link(base_url, room, host_name))
    }

    // ------------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------------

    fn reset_for_new_game(&mut self) {
        self.manual_disconnect = false;
        self.reconnect.reset();
        self.timers.cancel_many(&TimerKind::RECOVERY);
        self.timers.cancel(TimerKind::ConnectTimeout);
        if let Some(session) = self.session.take() {
            self.service.close_link(session.link);
        }
        self.end_session_monitoring();
        self.peer = None;
    }

    /// Replace any existing identity with a fresh request
    fn acquire_identity(&mut self, requested: Option<Identity>, now: Instant) {
        if self.identity != IdentityState::Absent {
            self.release_identity();
        }

        match self.service.create(requested.as_ref()) {
            Ok(()) => {
                log::debug!(
                    "Requested identity {}",
                    requested.as_ref().map(Identity::as_str).unwrap_or("<random>")
                );
                self.identity = IdentityState::Pending;
                self.timers
                    .arm(TimerKind::IdentityTimeout, now + self.config.identity_timeout);
            }
            Err(e) => self.identity_failed(e.into(), now),
        }
    }

    /// Destroy the handle together with any link routed through it
    fn release_identity(&mut self) {
        if self.session.take().is_some() {
            self.end_session_monitoring();
        }
        self.timers.cancel(TimerKind::IdentityTimeout);
        self.service.destroy();
        self.identity = IdentityState::Absent;
        self.identity_used = false;
    }

    fn identity_failed(&mut self, error: ConnectionError, now: Instant) {
        log::warn!("Identity unavailable: {}", error);
        self.timers.cancel(TimerKind::IdentityTimeout);
        self.timers.cancel(TimerKind::ConnectTimeout);
        self.service.destroy();
        self.identity = IdentityState::Absent;
        self.identity_used = false;
        self.after_identity = None;

        self.emit(ConnectionEvent::Error(error));
        if self.reconnect.in_progress() {
            self.attempt_failed(now);
        }
    }

    fn resume_after_identity(&mut self, now: Instant) {
        match self.after_identity.take() {
            Some(AfterIdentity::Connect { reconnect }) => self.open_link(reconnect, now),
            Some(AfterIdentity::AwaitGuest) => self.await_guest(now),
            None => {}
        }
    }

    // ------------------------------------------------------------------------
    // Session Setup
    // ------------------------------------------------------------------------

    /// Guest: make sure a usable identity exists, then address the room
    fn start_join(&mut self, reconnect: bool, now: Instant) {
        self.after_identity = Some(AfterIdentity::Connect { reconnect });

        match (&self.identity, self.identity_used) {
            (IdentityState::Ready(_), false) => self.resume_after_identity(now),
            (IdentityState::Pending, false) => {}
            _ => {
                let requested = None;
                self.acquire_identity(requested, now);
            }
        }
    }

    fn open_link(&mut self, reconnect: bool, now: Instant) {
        let (room, local) = match (&self.room, &self.local) {
            (Some(room), Some(local)) => (room.clone(), local.clone()),
            _ => return,
        };

        let metadata = ConnectMetadata {
            name: local.name,
            gender: local.gender,
            reconnect,
        };

        log::info!("Attempting to connect to room {}", room);
        self.identity_used = true;
        match self.service.connect(&room, &metadata) {
            Ok(link) => {
                self.session = Some(Session::new(link, room));
                if reconnect {
                    self.timers
                        .arm(TimerKind::SettleCheck, now + self.config.reconnect.settle_time);
                }
            }
            Err(e) => {
                log::warn!("Connect to {} failed: {}", room, e);
                self.timers.cancel(TimerKind::ConnectTimeout);
                self.emit(ConnectionEvent::Error(e.into()));
                if self.reconnect.in_progress() {
                    self.attempt_failed(now);
                }
            }
        }
    }

    fn await_guest(&mut self, now: Instant) {
        log::info!(
            "Waiting up to {:?} for the guest to return",
            self.config.reconnect.host_wait
        );
        self.timers
            .arm(TimerKind::HostRecoveryWait, now + self.config.reconnect.host_wait);
    }

    fn identity_envelope(&self) -> Option<Envelope> {
        let local = self.local.as_ref()?;
        match self.role? {
            Role::Host => Some(Envelope::HostInfo {
                name: local.name.clone(),
                gender: local.gender.clone(),
                player_type: local.player_type.clone().unwrap_or_default(),
            }),
            Role::Guest => Some(Envelope::GuestInfo {
                name: local.name.clone(),
                gender: local.gender.clone(),
                reconnect: self.reconnect.in_progress(),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Transport Events
    // ------------------------------------------------------------------------

    fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::IdentityAssigned(id) => self.on_identity_assigned(id, now),
            TransportEvent::SignalingFailed(e) => self.on_signaling_failed(e, now),
            TransportEvent::Disconnected => self.on_signaling_disconnected(now),
            TransportEvent::IncomingLink {
                link,
                peer,
                metadata,
            } => self.on_incoming_link(link, peer, metadata),
            TransportEvent::LinkOpened(link) => self.on_link_opened(link, now),
            TransportEvent::LinkData(link, bytes) => self.on_link_data(link, &bytes, now),
            TransportEvent::LinkClosed(link) => self.on_link_lost(link, None, now),
            TransportEvent::LinkError(link, e) => self.on_link_lost(link, Some(e), now),
        }
    }

    fn on_identity_assigned(&mut self, id: Identity, now: Instant) {
        if self.identity != IdentityState::Pending {
            log::debug!("Ignoring identity {} assigned while none was pending", id);
            return;
        }

        self.timers.cancel(TimerKind::IdentityTimeout);
        log::info!("My identity is {}", id);
        self.identity = IdentityState::Ready(id.clone());
        self.emit(ConnectionEvent::IdentityReady(id));
        self.resume_after_identity(now);
    }

    fn on_signaling_failed(&mut self, error: TransportError, now: Instant) {
        if self.identity == IdentityState::Pending {
            self.identity_failed(error.into(), now);
            return;
        }
        log::warn!("Signaling error: {}", error);
        self.emit(ConnectionEvent::Error(error.into()));
    }

    fn on_signaling_disconnected(&mut self, now: Instant) {
        if self.identity == IdentityState::Pending {
            self.identity_failed(
                ConnectionError::new(
                    ErrorKind::SignalingUnavailable,
                    "Lost the signaling service while waiting for an identity",
                ),
                now,
            );
            return;
        }
        log::warn!("Signaling handle lost; identity will be recreated when needed");
        self.identity = IdentityState::Absent;
    }

    fn on_incoming_link(&mut self, link: LinkId, peer: Identity, metadata: ConnectMetadata) {
        if self.role != Some(Role::Host) || self.manual_disconnect || self.reconnect.is_failed() {
            log::warn!("Refusing {} from {}: not accepting connections", link, peer);
            self.service.close_link(link);
            return;
        }

        if let Some(current) = &self.session {
            if !metadata.reconnect {
                log::warn!(
                    "Refusing {} from {}: already paired with {}",
                    link,
                    peer,
                    current.peer
                );
                self.service.close_link(link);
                return;
            }

            log::info!(
                "Returning guest {} on {} replaces {}",
                peer,
                link,
                current.link
            );
            let stale = current.link;
            self.service.close_link(stale);
            self.session = None;
            self.end_session_monitoring();
        }

        log::info!("Incoming connection {} from {} ({})", link, peer, metadata.name);
        self.peer = Some(PlayerProfile::guest(metadata.name, metadata.gender));
        self.session = Some(Session::new(link, peer));
    }

    fn on_link_opened(&mut self, link: LinkId, now: Instant) {
        let session = match self.session.as_mut() {
            Some(session) if session.link == link && !session.open => session,
            _ => {
                log::debug!("Ignoring open of inactive {}", link);
                return;
            }
        };
        session.open = true;
        log::info!("Session {} open with {}", link, session.peer);

        self.timers.cancel(TimerKind::ConnectTimeout);
        self.health.start(now);
        self.timers
            .arm(TimerKind::KeepAlive, now + self.config.keepalive_interval);
        let check_at = self.health.next_check_at(
            now,
            self.config.staleness_check_interval,
            self.config.stale_after,
        );
        self.timers.arm(TimerKind::StalenessCheck, check_at);

        if let Some(hello) = self.identity_envelope() {
            self.send(&hello);
        }
    }

    fn on_link_data(&mut self, link: LinkId, bytes: &[u8], now: Instant) {
        match &self.session {
            Some(session) if session.link == link && session.open => {}
            _ => {
                log::debug!("Dropping data on inactive {}", link);
                return;
            }
        }

        self.health.record_activity(now);

        let envelope = match envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Dropping envelope on {}: {}", link, e);
                return;
            }
        };
        self.dispatch_envelope(envelope, now);
    }

    fn dispatch_envelope(&mut self, envelope: Envelope, now: Instant) {
        let now_ms = self.now_ms(now);

        match envelope {
            Envelope::Ping { seq, timestamp } => {
                self.send(&HealthMonitor::echo(seq, timestamp, now_ms));
            }
            Envelope::Pong { seq, timestamp, .. } => {
                if let Some(rtt) = self.health.record_pong(timestamp, now_ms) {
                    log::debug!(
                        "Connection latency: {}ms (seq {}, avg {:?})",
                        rtt.as_millis(),
                        seq,
                        self.health.average_rtt()
                    );
                }
            }
            Envelope::HealthCheck { timestamp } => {
                self.send(&Envelope::HealthResponse {
                    timestamp,
                    responded_at: now_ms,
                });
            }
            Envelope::HealthResponse { .. } => {
                if self.health.is_suspect() {
                    log::info!("Staleness probe answered, session healthy");
                }
                self.health.clear_suspicion();
                self.timers.cancel(TimerKind::StalenessFollowUp);
            }
            Envelope::GuestInfo {
                name,
                gender,
                reconnect,
            } => {
                if self.role != Some(Role::Host) {
                    log::warn!("Ignoring guest-info received as {:?}", self.role);
                    return;
                }
                self.peer = Some(PlayerProfile::guest(name, gender));
                self.identity_exchanged(reconnect);
            }
            Envelope::HostInfo {
                name,
                gender,
                player_type,
            } => {
                if self.role != Some(Role::Guest) {
                    log::warn!("Ignoring host-info received as {:?}", self.role);
                    return;
                }
                self.peer = Some(PlayerProfile::host(name, gender, player_type));
                self.identity_exchanged(false);
            }
            other => {
                log::trace!("Received {}", other.tag());
                self.emit(ConnectionEvent::Data(other));
            }
        }
    }

    fn identity_exchanged(&mut self, peer_reconnecting: bool) {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return,
        };
        if session.exchanged {
            return;
        }
        session.exchanged = true;

        let was_reconnect = peer_reconnecting || self.reconnect.in_progress();
        let peer = self.peer.clone().unwrap_or_default();
        log::info!(
            "Connection established with {}{}",
            peer.name,
            if was_reconnect { " (reconnected)" } else { "" }
        );
        self.emit(ConnectionEvent::Established {
            was_reconnect,
            peer,
        });

        // The guest confirms at its settle check
        if self.role == Some(Role::Host) && self.reconnect.in_progress() {
            self.confirm_recovery();
        }
    }

    fn on_link_lost(&mut self, link: LinkId, error: Option<TransportError>, now: Instant) {
        let (was_open, peer) = match &self.session {
            Some(session) if session.link == link => (session.open, session.peer.clone()),
            _ => {
                log::debug!("Ignoring loss of inactive {}", link);
                return;
            }
        };
        self.session = None;
        self.end_session_monitoring();

        if !was_open {
            self.timers.cancel(TimerKind::ConnectTimeout);
            if self.role == Some(Role::Guest) {
                let error = match error {
                    Some(e) => ConnectionError::new(
                        e.kind(),
                        format!(
                            "Could not connect to peer {}. The room may not exist or the host may have disconnected. ({})",
                            peer, e.message
                        ),
                    ),
                    None => ConnectionError::new(
                        ErrorKind::PeerUnreachable,
                        format!("Connection to {} closed before it opened", peer),
                    ),
                };
                log::warn!("{}", error);
                self.emit(ConnectionEvent::Error(error));
            } else {
                log::debug!("Inbound {} from {} dropped before opening", link, peer);
            }

            if self.reconnect.in_progress() && self.role == Some(Role::Guest) {
                self.attempt_failed(now);
            }
            return;
        }

        match error {
            Some(e) => {
                log::warn!("Connection error on {}: {}", link, e);
                self.emit(ConnectionEvent::Error(e.into()));
            }
            None => log::info!("Connection {} closed", link),
        }
        self.session_lost(now);
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn handle_timer(&mut self, timer: TimerKind, now: Instant) {
        match timer {
            TimerKind::IdentityTimeout => {
                if self.identity == IdentityState::Pending {
                    let error = ConnectionError::new(
                        ErrorKind::SignalingUnavailable,
                        format!(
                            "Signaling service did not respond within {}s",
                            self.config.identity_timeout.as_secs()
                        ),
                    );
                    self.identity_failed(error, now);
                }
            }
            TimerKind::ConnectTimeout => self.connect_timed_out(),
            TimerKind::KeepAlive => self.send_keepalive(now),
            TimerKind::StalenessCheck => self.check_staleness(now),
            TimerKind::StalenessFollowUp => self.staleness_follow_up(now),
            TimerKind::Backoff => self.run_attempt(now),
            TimerKind::SettleCheck => self.settle_check(now),
            TimerKind::HostRecoveryWait => {
                let error = ConnectionError::new(
                    ErrorKind::ReconnectionTimeout,
                    format!(
                        "No guest returned within {}s",
                        self.config.reconnect.host_wait.as_secs()
                    ),
                );
                log::warn!("{}", error);
                self.emit(ConnectionEvent::Error(error));
                self.attempt_failed(now);
            }
        }
    }

    fn connect_timed_out(&mut self) {
        if self.is_connected() {
            return;
        }
        if let Some(session) = self.session.take() {
            self.service.close_link(session.link);
        }
        self.after_identity = None;

        let error = ConnectionError::new(
            ErrorKind::ConnectionTimeout,
            "Connection timeout. The host may not be available.",
        );
        log::warn!("{}", error);
        self.emit(ConnectionEvent::Error(error));
    }

    fn send_keepalive(&mut self, now: Instant) {
        if !self.is_connected() {
            return;
        }
        let ping = self.health.next_keepalive(self.now_ms(now));
        self.send(&ping);
        self.timers
            .arm(TimerKind::KeepAlive, now + self.config.keepalive_interval);
    }

    fn check_staleness(&mut self, now: Instant) {
        if !self.is_connected() {
            return;
        }

        match self.health.check_staleness(now, self.config.stale_after) {
            StalenessVerdict::Probe => {
                log::warn!(
                    "No message for {:?}, probing session health",
                    self.health.silence(now)
                );
                let probe = HealthMonitor::probe(self.now_ms(now));
                self.send(&probe);
                let follow_up =
                    self.health
                        .follow_up_at(now, self.config.probe_grace, self.config.dead_after);
                self.timers.arm(TimerKind::StalenessFollowUp, follow_up);
            }
            StalenessVerdict::AwaitingProbe => log::debug!(
                "Probe outstanding, silent for {:?}",
                self.health.silence(now)
            ),
            StalenessVerdict::Healthy => {}
        }

        let next = self.health.next_check_at(
            now,
            self.config.staleness_check_interval,
            self.config.stale_after,
        );
        self.timers.arm(TimerKind::StalenessCheck, next);
    }

    fn staleness_follow_up(&mut self, now: Instant) {
        if !self.is_connected() {
            return;
        }
        if !self.health.follow_up(now, self.config.dead_after) {
            log::info!("Traffic resumed, session no longer suspect");
            return;
        }

        let silence = self.health.silence(now);
        if let Some(session) = self.session.take() {
            log::warn!(
                "Session {} silent for {:?}, closing as stale",
                session.link,
                silence
            );
            self.service.close_link(session.link);
        }
        self.end_session_monitoring();

        self.emit(ConnectionEvent::Error(ConnectionError::new(
            ErrorKind::StaleConnection,
            format!("No message from peer for {}s", silence.as_secs()),
        )));
        self.session_lost(now);
    }

    // ------------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------------

    fn session_lost(&mut self, now: Instant) {
        if self.manual_disconnect {
            self.emit(ConnectionEvent::Closed);
            return;
        }
        match self.reconnect.begin() {
            Transition::Schedule { attempt, max } => self.schedule_attempt(attempt, max, now),
            Transition::Exhausted => self.give_up(),
            Transition::Ignored => {
                log::debug!("Reconnection already {:?}", self.reconnect.state());
            }
        }
    }

    fn attempt_failed(&mut self, now: Instant) {
        self.timers
            .cancel_many(&[TimerKind::SettleCheck, TimerKind::HostRecoveryWait]);
        match self.reconnect.retry() {
            Transition::Schedule { attempt, max } => {
                log::info!("Reconnection failed, trying again");
                self.schedule_attempt(attempt, max, now);
            }
            Transition::Exhausted => self.give_up(),
            Transition::Ignored => {}
        }
    }

    fn schedule_attempt(&mut self, attempt: u32, max: u32, now: Instant) {
        let policy = self.reconnect.policy();
        let unit = if policy.max_jitter.is_zero() {
            0.0
        } else {
            self.random.next_unit()
        };
        let delay = self.reconnect.policy().delay(attempt, unit);

        log::info!("Reconnection attempt {}/{} in {:?}", attempt, max, delay);
        self.timers.arm(TimerKind::Backoff, now + delay);
        self.emit(ConnectionEvent::Reconnecting { attempt, max });
    }

    fn run_attempt(&mut self, now: Instant) {
        let role = match self.role {
            Some(role) => role,
            None => return,
        };

        match self.reconnect.backoff_elapsed(role) {
            Some(ReconnectState::RecoveringHost) => match self.identity {
                IdentityState::Ready(_) => self.await_guest(now),
                IdentityState::Pending => self.after_identity = Some(AfterIdentity::AwaitGuest),
                IdentityState::Absent => {
                    log::info!("Recreating room identity");
                    self.after_identity = Some(AfterIdentity::AwaitGuest);
                    let room = self.room.clone();
                    self.acquire_identity(room, now);
                }
            },
            Some(ReconnectState::RecoveringGuest) => self.start_join(true, now),
            _ => {}
        }
    }

    fn settle_check(&mut self, now: Instant) {
        if self.reconnect.state() != ReconnectState::RecoveringGuest {
            return;
        }

        let settled = self.session.as_ref().is_some_and(|s| s.open && s.exchanged);
        if settled {
            self.confirm_recovery();
            return;
        }

        log::info!("Re-join did not settle");
        if let Some(session) = self.session.take() {
            self.service.close_link(session.link);
            self.end_session_monitoring();
        }
        self.after_identity = None;
        self.attempt_failed(now);
    }

    fn confirm_recovery(&mut self) {
        self.timers.cancel_many(&TimerKind::RECOVERY);
        if self.reconnect.confirm() {
            log::info!("Reconnection successful");
            self.emit(ConnectionEvent::Reconnected);
        }
    }

    fn give_up(&mut self) {
        let max = self.reconnect.policy().max_attempts;
        log::error!("Max reconnection attempts reached ({})", max);

        self.timers.cancel_all();
        self.after_identity = None;
        if let Some(session) = self.session.take() {
            self.service.close_link(session.link);
        }
        self.end_session_monitoring();
        if self.identity != IdentityState::Absent {
            self.release_identity();
        }

        self.emit(ConnectionEvent::Error(ConnectionError::new(
            ErrorKind::ReconnectionExhausted,
            format!("Gave up after {} reconnection attempts", max),
        )));
        self.emit(ConnectionEvent::ReconnectFailed);
        self.emit(ConnectionEvent::Closed);
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn end_session_monitoring(&mut self) {
        self.timers.cancel_many(&TimerKind::SESSION);
        self.health.stop();
    }

    fn now_ms(&self, now: Instant) -> u64 {
        duration_ms(now.saturating_duration_since(self.epoch))
    }

    fn emit(&mut self, event: ConnectionEvent) {
        self.events.emit(&event);
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

// ============================================================================
// Tests
// ============================================================================
