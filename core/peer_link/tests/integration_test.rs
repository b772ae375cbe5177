//! Integration test for Peer Link
//!
//! Drives a host and a guest manager over an in-process loopback hub with a
//! stepped virtual clock: pairing, data passthrough, keep-alive, staleness,
//! reconnection budget and timeouts.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use peer_link::{
    ConnectionEvent, ConnectionManager, Envelope, ErrorKind, EventKind, GameData, Identity,
    LoopbackEndpoint, LoopbackHub, ManagerConfig, PlayerProfile, ReconnectPolicy, ReconnectState,
    SequenceRandom,
};

type Recorded = Rc<RefCell<Vec<ConnectionEvent>>>;

struct Peer {
    mgr: ConnectionManager<LoopbackEndpoint>,
    events: Recorded,
}

impl Peer {
    fn new(hub: &LoopbackHub, config: &ManagerConfig, seed: u32) -> Self {
        let mut mgr = ConnectionManager::with_random(
            hub.endpoint(),
            config.clone(),
            Box::new(SequenceRandom::new(vec![seed])),
        );
        let events: Recorded = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        mgr.subscribe(move |e| sink.borrow_mut().push(e.clone()));
        Peer { mgr, events }
    }

    fn errors(&self) -> Vec<ErrorKind> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::Error(err) => Some(err.kind),
                _ => None,
            })
            .collect()
    }

    fn count(&self, kind: EventKind) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }

    fn reconnect_attempts_reported(&self) -> Vec<u32> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::Reconnecting { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect()
    }

    fn data(&self) -> Vec<Envelope> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::Data(env) => Some(env.clone()),
                _ => None,
            })
            .collect()
    }

    fn clear(&self) {
        self.events.borrow_mut().clear();
    }
}

struct Harness {
    hub: LoopbackHub,
    host: Peer,
    guest: Peer,
    extra: Option<Peer>,
    config: ManagerConfig,
    now: Instant,
}

/// Defaults with jitter disabled so backoff delays are exact
fn test_config() -> ManagerConfig {
    ManagerConfig {
        reconnect: ReconnectPolicy {
            max_jitter: Duration::ZERO,
            ..ReconnectPolicy::default()
        },
        ..ManagerConfig::default()
    }
}

fn alice() -> PlayerProfile {
    PlayerProfile::host("Alice", "female", "real")
}

fn bob() -> PlayerProfile {
    PlayerProfile::guest("Bob", "male")
}

impl Harness {
    fn new() -> Self {
        Self::with_config(test_config())
    }

    fn with_config(config: ManagerConfig) -> Self {
        let hub = LoopbackHub::new();
        let host = Peer::new(&hub, &config, 4821);
        let guest = Peer::new(&hub, &config, 77);
        Harness {
            hub,
            host,
            guest,
            extra: None,
            config,
            now: Instant::now(),
        }
    }

    /// Let every queued transport event settle at the current instant
    fn pump(&mut self) {
        for _ in 0..16 {
            self.host.mgr.poll(self.now);
            self.guest.mgr.poll(self.now);
            if let Some(extra) = self.extra.as_mut() {
                extra.mgr.poll(self.now);
            }
        }
    }

    /// Move the clock forward, visiting every deadline on the way
    fn advance(&mut self, by: Duration) {
        let target = self.now + by;
        loop {
            let next = [
                self.host.mgr.next_deadline(),
                self.guest.mgr.next_deadline(),
                self.extra.as_ref().and_then(|p| p.mgr.next_deadline()),
            ]
            .into_iter()
            .flatten()
            .min();

            match next {
                Some(at) if at <= target => {
                    self.now = self.now.max(at);
                    self.pump();
                }
                _ => break,
            }
        }
        self.now = target;
        self.pump();
    }

    fn secs(&mut self, s: f64) {
        self.advance(Duration::from_millis((s * 1000.0).round() as u64));
    }

    fn pair(&mut self) -> Identity {
        let room = self.host.mgr.host(alice(), self.now);
        self.pump();
        self.guest.mgr.join(room.clone(), bob(), self.now);
        self.pump();
        room
    }
}

// ============================================================================
// Pairing
// ============================================================================

#[test]
fn test_host_guest_round_trip() {
    let mut h = Harness::new();
    let room = h.pair();

    assert!(room.is_room_code(), "bad room code {}", room);
    assert_eq!(room.as_str(), "LOVE-5821");
    assert!(h.host.mgr.is_connected());
    assert!(h.guest.mgr.is_connected());

    assert!(h.host.events.borrow().contains(&ConnectionEvent::Established {
        was_reconnect: false,
        peer: bob(),
    }));
    assert!(h.guest.events.borrow().contains(&ConnectionEvent::Established {
        was_reconnect: false,
        peer: alice(),
    }));
    assert_eq!(h.host.count(EventKind::Established), 1);
    assert_eq!(h.guest.count(EventKind::Established), 1);

    assert_eq!(h.host.mgr.partner_name(), Some("Bob"));
    assert_eq!(h.guest.mgr.partner_name(), Some("Alice"));
    assert_eq!(h.guest.mgr.partner_gender(), Some("female"));
    assert_eq!(h.guest.mgr.host_player_type(), Some("real"));
    assert!(h.host.errors().is_empty());
    assert!(h.guest.errors().is_empty());
}

#[test]
fn test_identity_ready_reported() {
    let mut h = Harness::new();
    let room = h.pair();

    assert_eq!(
        h.host.events.borrow().first(),
        Some(&ConnectionEvent::IdentityReady(room.clone()))
    );
    let guest_id = h.guest.mgr.identity().cloned().unwrap();
    assert_ne!(guest_id, room);
    assert_eq!(h.host.mgr.session_peer(), Some(&guest_id));
}

#[test]
fn test_shareable_link_carries_room_and_host() {
    let mut h = Harness::new();
    let room = h.pair();

    let link = h.host.mgr.shareable_link("https://lovegame.example/").unwrap();
    assert_eq!(
        link,
        format!("https://lovegame.example/?room={}&host=Alice", room)
    );
    assert_eq!(h.guest.mgr.shareable_link("https://lovegame.example/"), Some(link));
}

#[test]
fn test_second_inbound_link_rejected() {
    let mut h = Harness::new();
    let room = h.pair();

    let mut eve = Peer::new(&h.hub, &h.config, 5);
    eve.mgr
        .join(room, PlayerProfile::guest("Eve", "female"), h.now);
    h.extra = Some(eve);
    h.pump();

    let eve = h.extra.as_ref().unwrap();
    assert_eq!(eve.errors(), vec![ErrorKind::PeerUnreachable]);
    assert_eq!(eve.count(EventKind::Established), 0);
    assert!(!eve.mgr.is_connected());

    assert!(h.host.mgr.is_connected());
    assert_eq!(h.host.mgr.partner_name(), Some("Bob"));
    assert_eq!(h.host.count(EventKind::Established), 1);
}

// ============================================================================
// Messaging
// ============================================================================

#[test]
fn test_unknown_type_passthrough() {
    let mut h = Harness::new();
    h.pair();

    let custom = Envelope::from_value(serde_json::json!({
        "type": "foo",
        "payload": [1, 2, 3],
    }))
    .unwrap();
    assert!(h.guest.mgr.send(&custom));
    assert!(h.guest.mgr.send_game_update(GameData {
        player_x: 12.5,
        player_y: 3.0,
        score: 7,
        is_jumping: true,
    }));
    h.pump();

    let data = h.host.data();
    assert_eq!(data.len(), 2);
    assert_eq!(
        data[0].to_value().unwrap(),
        serde_json::json!({"type": "foo", "payload": [1, 2, 3]})
    );
    assert!(matches!(&data[1], Envelope::GameUpdate { game_data } if game_data.score == 7));
}

#[test]
fn test_keepalive_echo_not_forwarded() {
    let mut h = Harness::new();
    h.pair();
    h.secs(35.0);

    let stats = h.guest.mgr.health_stats();
    assert_eq!(stats.pings_sent, 3);
    assert_eq!(stats.pongs_received, 3);
    assert!(stats.last_rtt.is_some());
    assert!(stats.average_rtt.is_some());
    assert_eq!(h.host.mgr.health_stats().pongs_received, 3);

    // Only application envelopes surface
    assert!(h.host.data().is_empty());
    assert!(h.guest.data().is_empty());
    assert!(h.host.errors().is_empty());
}

#[test]
fn test_send_without_session_returns_false() {
    let hub = LoopbackHub::new();
    let mut lonely = Peer::new(&hub, &test_config(), 1);

    assert!(!lonely.mgr.send(&Envelope::PlayAgain));
    assert!(!lonely.mgr.send_play_again());
    assert!(lonely.events.borrow().is_empty());
}

// ============================================================================
// Staleness
// ============================================================================

#[test]
fn test_staleness_check_then_forced_close() {
    let mut h = Harness::new();
    let room = h.pair();
    h.hub.partition(&room);

    h.secs(39.9);
    assert_eq!(h.host.mgr.health_stats().probes_sent, 0);

    // Probe goes out as silence crosses 40s, well before 50s
    h.secs(1.0);
    assert_eq!(h.host.mgr.health_stats().probes_sent, 1);
    assert!(h.host.mgr.health_stats().suspect);
    assert!(h.host.errors().is_empty());

    h.secs(9.0);
    assert!(h.host.mgr.is_connected());
    assert!(h.host.errors().is_empty());

    h.secs(0.2);
    assert_eq!(h.host.errors(), vec![ErrorKind::StaleConnection]);
    assert!(!h.host.mgr.is_connected());
    assert!(!h.guest.mgr.is_connected());
    assert_eq!(h.host.reconnect_attempts_reported(), vec![1]);
    assert_eq!(h.guest.reconnect_attempts_reported(), vec![1]);
}

#[test]
fn test_short_grace_still_closes_at_dead_after() {
    let mut h = Harness::with_config(ManagerConfig {
        probe_grace: Duration::from_secs(5),
        ..test_config()
    });
    assert!(h.config.validate().is_ok());
    let room = h.pair();
    h.hub.partition(&room);

    h.secs(40.5);
    assert_eq!(h.host.mgr.health_stats().probes_sent, 1);

    // The grace ends at 45s but silence has not yet reached 50s
    h.secs(9.0);
    assert!(h.host.mgr.is_connected());
    assert!(h.host.errors().is_empty());
    assert_eq!(h.host.mgr.health_stats().probes_sent, 1);

    h.secs(0.7);
    assert_eq!(h.host.errors(), vec![ErrorKind::StaleConnection]);
    assert!(!h.host.mgr.is_connected());
}

#[test]
fn test_steady_keepalive_stays_healthy() {
    let mut h = Harness::new();
    h.pair();

    // Keep-alives flow, so no probe is ever needed
    h.secs(120.0);
    assert_eq!(h.host.mgr.health_stats().probes_sent, 0);
    assert!(h.host.mgr.is_connected());
    assert!(h.host.errors().is_empty());
}

// ============================================================================
// Reconnection
// ============================================================================

#[test]
fn test_guest_budget_exhaustion() {
    let mut h = Harness::new();
    h.pair();

    // Host leaves for good
    h.host.mgr.close();
    h.guest.clear();
    h.pump();

    h.secs(60.0);
    assert_eq!(h.guest.reconnect_attempts_reported(), vec![1, 2, 3]);
    assert_eq!(h.guest.count(EventKind::ReconnectFailed), 1);
    assert_eq!(h.guest.count(EventKind::Closed), 1);
    assert_eq!(h.guest.mgr.reconnect_state(), ReconnectState::Failed);

    let events = h.guest.events.borrow().clone();
    let tail: Vec<EventKind> = events[events.len() - 3..].iter().map(|e| e.kind()).collect();
    assert_eq!(
        tail,
        vec![EventKind::Error, EventKind::ReconnectFailed, EventKind::Closed]
    );
    assert_eq!(h.guest.errors().last(), Some(&ErrorKind::ReconnectionExhausted));

    // Nothing more, ever
    let settled = h.guest.events.borrow().len();
    h.secs(300.0);
    assert_eq!(h.guest.events.borrow().len(), settled);
}

#[test]
fn test_host_budget_exhaustion() {
    let mut h = Harness::new();
    let room = h.pair();

    h.guest.mgr.close();
    h.host.clear();
    h.pump();

    // Three attempts of backoff plus the 60s wait each
    h.secs(180.0);
    assert_eq!(h.host.reconnect_attempts_reported(), vec![1, 2, 3]);
    assert_eq!(h.host.count(EventKind::ReconnectFailed), 0);

    h.secs(10.0);
    assert_eq!(
        h.host.errors(),
        vec![
            ErrorKind::ReconnectionTimeout,
            ErrorKind::ReconnectionTimeout,
            ErrorKind::ReconnectionTimeout,
            ErrorKind::ReconnectionExhausted,
        ]
    );
    assert_eq!(h.host.count(EventKind::ReconnectFailed), 1);
    assert_eq!(h.host.count(EventKind::Closed), 1);
    assert!(!h.hub.is_registered(&room));
}

#[test]
fn test_reconnect_resets_counter() {
    let mut h = Harness::new();
    let room = h.pair();

    let established = Rc::new(RefCell::new(0));
    let counter = established.clone();
    h.guest
        .mgr
        .once(EventKind::Established, move |_| *counter.borrow_mut() += 1);

    h.hub.sever(&room);
    h.pump();
    assert_eq!(h.host.reconnect_attempts_reported(), vec![1]);
    assert_eq!(h.guest.reconnect_attempts_reported(), vec![1]);

    // Backoff, re-join, then the guest's settle check
    h.secs(7.0);
    assert!(h.host.mgr.is_connected());
    assert!(h.guest.mgr.is_connected());
    assert_eq!(h.host.count(EventKind::Reconnected), 1);
    assert_eq!(h.guest.count(EventKind::Reconnected), 1);
    assert!(h.host.events.borrow().contains(&ConnectionEvent::Established {
        was_reconnect: true,
        peer: bob(),
    }));
    assert!(h.guest.events.borrow().contains(&ConnectionEvent::Established {
        was_reconnect: true,
        peer: alice(),
    }));
    assert_eq!(*established.borrow(), 1);

    assert_eq!(h.host.mgr.reconnect_attempts(), 0);
    assert_eq!(h.guest.mgr.reconnect_attempts(), 0);
    assert_eq!(h.guest.mgr.reconnect_state(), ReconnectState::Idle);

    // A later drop starts counting from one again
    h.hub.sever(&room);
    h.pump();
    assert_eq!(h.guest.reconnect_attempts_reported(), vec![1, 1]);
    assert_eq!(h.host.reconnect_attempts_reported(), vec![1, 1]);
}

#[test]
fn test_identity_loss_during_recovery_counts_as_attempt() {
    let mut h = Harness::new();
    let room = h.pair();

    h.guest.clear();
    h.hub.sever(&room);
    h.hub.set_available(false);
    h.pump();
    assert_eq!(h.guest.reconnect_attempts_reported(), vec![1]);

    // Attempt 1 at 1s asks for a new identity that never comes
    h.secs(16.5);
    assert_eq!(h.guest.errors(), vec![ErrorKind::SignalingUnavailable]);
    assert_eq!(h.guest.reconnect_attempts_reported(), vec![1, 2]);
    assert_eq!(h.guest.mgr.reconnect_state(), ReconnectState::Reconnecting);

    // Attempts 2 and 3 time out the same way
    h.secs(40.0);
    assert_eq!(h.guest.reconnect_attempts_reported(), vec![1, 2, 3]);
    assert_eq!(
        h.guest.errors(),
        vec![
            ErrorKind::SignalingUnavailable,
            ErrorKind::SignalingUnavailable,
            ErrorKind::SignalingUnavailable,
            ErrorKind::ReconnectionExhausted,
        ]
    );
    assert_eq!(h.guest.count(EventKind::ReconnectFailed), 1);
    assert_eq!(h.guest.mgr.reconnect_state(), ReconnectState::Failed);
}

#[test]
fn test_initialize_ignored_while_paired() {
    let mut h = Harness::new();
    let room = h.pair();
    h.host.clear();

    h.host.mgr.initialize(None, h.now);
    h.pump();

    assert!(h.host.mgr.is_connected());
    assert!(h.guest.mgr.is_connected());
    assert_eq!(h.host.mgr.identity(), Some(&room));
    assert!(h.hub.is_registered(&room));
    assert!(h.host.events.borrow().is_empty());
}

#[test]
fn test_manual_close_stops_attempts() {
    let mut h = Harness::new();
    h.pair();

    h.host.mgr.close();
    h.pump();
    assert_eq!(h.guest.reconnect_attempts_reported(), vec![1]);

    h.guest.clear();
    h.guest.mgr.close();
    assert_eq!(*h.guest.events.borrow(), vec![ConnectionEvent::Closed]);

    h.secs(300.0);
    assert_eq!(*h.guest.events.borrow(), vec![ConnectionEvent::Closed]);
    assert_eq!(h.guest.mgr.reconnect_state(), ReconnectState::Idle);
    assert!(h.guest.mgr.next_deadline().is_none());

    // Idempotent
    h.guest.mgr.close();
    assert_eq!(h.guest.events.borrow().len(), 1);
}

// ============================================================================
// Timeouts
// ============================================================================

#[test]
fn test_join_connection_timeout() {
    let mut h = Harness::new();
    let room = h.host.mgr.host(alice(), h.now);
    h.pump();
    h.hub.partition(&room);

    h.guest.mgr.join(room, bob(), h.now);
    h.pump();

    h.secs(19.9);
    assert!(h.guest.errors().is_empty());
    h.secs(0.1);
    assert_eq!(h.guest.errors(), vec![ErrorKind::ConnectionTimeout]);

    // Not retried
    h.secs(300.0);
    assert_eq!(h.guest.errors(), vec![ErrorKind::ConnectionTimeout]);
    assert_eq!(h.guest.count(EventKind::Reconnecting), 0);
    assert_eq!(h.host.count(EventKind::Established), 0);
}

#[test]
fn test_signaling_unavailable() {
    let mut h = Harness::new();
    h.hub.set_available(false);

    h.host.mgr.host(alice(), h.now);
    h.pump();

    h.secs(14.9);
    assert!(h.host.errors().is_empty());
    h.secs(0.1);
    assert_eq!(h.host.errors(), vec![ErrorKind::SignalingUnavailable]);
    assert!(h.host.mgr.identity().is_none());
}
