//! Game session: the application side of a peer connection
//!
//! Consumes manager events, moves between screens, runs the round and keeps
//! the partner informed. Manager listeners only queue events; the session
//! reacts to them after each poll, so it is free to call back into the
//! manager while handling them.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use peer_link::{
    ConnectionError, ConnectionEvent, ConnectionManager, Envelope, ErrorKind, EventKind,
    GameResults, Identity, ListenerId, PlayerProfile, RandomSource, ReconnectState,
    SignalingService, SystemRandomSource,
};

use crate::game::{GameRunner, GameTick, GAME_DURATION};
use crate::metrics::Metrics;

const JOIN_HELP: &str = "\n\nPossible reasons:\n\
                         - The room code may be incorrect\n\
                         - The host may have left or closed the room\n\
                         - There might be network connectivity issues";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screen {
    Welcome,
    /// Host waiting for the guest
    RoomCreated { room: Identity, link: String },
    Joining { room: Identity },
    Playing,
    Results,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum JoinOutcome {
    Joined,
    Failed(ConnectionError),
}

/// One-shot listeners resolving a join attempt
struct PendingJoin {
    established: ListenerId,
    error: ListenerId,
    outcome: Rc<RefCell<Option<JoinOutcome>>>,
}

pub struct GameSession<S: SignalingService> {
    mgr: ConnectionManager<S>,
    inbox: Rc<RefCell<VecDeque<ConnectionEvent>>>,
    screen: Screen,
    game: Option<GameRunner>,
    results: Option<GameResults>,
    notices: Vec<String>,
    pending_join: Option<PendingJoin>,
    game_duration: Duration,
    game_random: Option<Box<dyn RandomSource>>,
    base_url: String,
    metrics: Metrics,
}

impl<S: SignalingService> GameSession<S> {
    pub fn new(mut mgr: ConnectionManager<S>, base_url: &str) -> Self {
        let inbox = Rc::new(RefCell::new(VecDeque::new()));
        let sink = Rc::clone(&inbox);
        mgr.subscribe(move |event| sink.borrow_mut().push_back(event.clone()));

        Self {
            mgr,
            inbox,
            screen: Screen::Welcome,
            game: None,
            results: None,
            notices: Vec::new(),
            pending_join: None,
            game_duration: GAME_DURATION,
            game_random: None,
            base_url: base_url.to_string(),
            metrics: Metrics::new(),
        }
    }

    pub fn with_game_duration(mut self, duration: Duration) -> Self {
        self.game_duration = duration;
        self
    }

    /// Randomness for the first round's hearts
    pub fn with_game_random(mut self, random: Box<dyn RandomSource>) -> Self {
        self.game_random = Some(random);
        self
    }

    pub fn screen(&self) -> &Screen {
        &self.screen
    }

    pub fn results(&self) -> Option<&GameResults> {
        self.results.as_ref()
    }

    pub fn game(&self) -> Option<&GameRunner> {
        self.game.as_ref()
    }

    pub fn manager(&self) -> &ConnectionManager<S> {
        &self.mgr
    }

    pub fn manager_mut(&mut self) -> &mut ConnectionManager<S> {
        &mut self.mgr
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// User-facing messages since the last call
    pub fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notices)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.mgr.next_deadline()
    }

    // ------------------------------------------------------------------------
    // User Actions
    // ------------------------------------------------------------------------

    pub fn create_room(&mut self, name: &str, gender: &str, player_type: &str, now: Instant) -> Identity {
        let profile = PlayerProfile::host(name, gender, player_type);
        let room = self.mgr.host(profile, now);
        let link = self.mgr.shareable_link(&self.base_url).unwrap_or_default();
        log::info!("Room {} created, share {}", room, link);
        self.screen = Screen::RoomCreated {
            room: room.clone(),
            link,
        };
        room
    }

    pub fn join_room(&mut self, room: Identity, name: &str, gender: &str, now: Instant) {
        let profile = PlayerProfile::guest(name, gender);
        self.clear_pending_join();

        let outcome = Rc::new(RefCell::new(None));
        let joined = Rc::clone(&outcome);
        let established = self.mgr.once(EventKind::Established, move |_| {
            let mut slot = joined.borrow_mut();
            if slot.is_none() {
                *slot = Some(JoinOutcome::Joined);
            }
        });
        let failed = Rc::clone(&outcome);
        let error = self.mgr.once(EventKind::Error, move |event| {
            if let ConnectionEvent::Error(e) = event {
                let mut slot = failed.borrow_mut();
                if slot.is_none() {
                    *slot = Some(JoinOutcome::Failed(e.clone()));
                }
            }
        });
        self.pending_join = Some(PendingJoin {
            established,
            error,
            outcome,
        });

        self.screen = Screen::Joining { room: room.clone() };
        self.mgr.join(room, profile, now);
    }

    pub fn jump(&mut self) {
        if let Some(game) = self.game.as_mut() {
            game.jump();
        }
    }

    /// Start a new round from the results screen and tell the partner
    pub fn play_again(&mut self) -> bool {
        if self.screen != Screen::Results || !self.mgr.is_connected() {
            return false;
        }
        self.mgr.send_play_again();
        self.restart_game();
        true
    }

    pub fn leave(&mut self) {
        self.mgr.close();
        self.clear_pending_join();
        // Our own Closed is not news to the player
        self.inbox.borrow_mut().clear();
        self.to_welcome();
    }

    /// Drive the connection and, while playing, the round
    pub fn tick(&mut self, now: Instant, dt: Duration) {
        self.mgr.poll(now);
        self.drain_events();
        self.resolve_join();

        if self.screen != Screen::Playing {
            return;
        }
        let tick = match self.game.as_mut() {
            Some(game) => game.tick(dt),
            None => return,
        };
        match tick {
            GameTick::Update(data) => {
                if self.mgr.send_game_update(data) {
                    Metrics::inc(&self.metrics.game_updates_sent_total);
                }
            }
            GameTick::Finished(results) => {
                self.mgr.send_game_results(results.clone());
                self.show_results(results);
            }
            GameTick::Idle => {}
        }
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    fn drain_events(&mut self) {
        loop {
            let event = self.inbox.borrow_mut().pop_front();
            match event {
                Some(event) => self.handle_event(event),
                None => break,
            }
        }
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::IdentityReady(id) => log::debug!("Identity ready: {}", id),
            ConnectionEvent::Established {
                was_reconnect,
                peer,
            } => {
                Metrics::inc(&self.metrics.sessions_established_total);
                let resuming = matches!(self.screen, Screen::Playing | Screen::Results);
                if was_reconnect && resuming {
                    log::info!("Resumed session with {}", peer.name);
                } else {
                    self.start_game(&peer);
                }
            }
            ConnectionEvent::Data(envelope) => self.handle_data(envelope),
            ConnectionEvent::Closed => {
                self.notice("Your partner has disconnected. Returning to home screen.");
                self.to_welcome();
            }
            ConnectionEvent::Error(e) => {
                Metrics::inc(&self.metrics.connection_errors_total);
                log::warn!("Connection error: {}", e);

                // A failed join is reported once its listeners resolve
                let recovering = self.mgr.reconnect_state() != ReconnectState::Idle;
                if self.mgr.is_connected() || recovering || self.pending_join.is_some() {
                    return;
                }
                self.notice(&format!("Connection error: {}", e.message));
                self.to_welcome();
            }
            ConnectionEvent::Reconnecting { attempt, max } => {
                Metrics::inc(&self.metrics.reconnect_attempts_total);
                self.notice(&format!("Connection lost. Reconnecting ({}/{})...", attempt, max));
            }
            ConnectionEvent::Reconnected => {
                Metrics::inc(&self.metrics.reconnections_total);
                self.notice("Reconnected to your partner.");
            }
            ConnectionEvent::ReconnectFailed => {
                self.notice("Could not reconnect to your partner.");
            }
        }
    }

    fn handle_data(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::GameUpdate { game_data } => {
                Metrics::inc(&self.metrics.game_updates_received_total);
                if let Some(game) = self.game.as_mut() {
                    game.apply_partner(&game_data);
                }
            }
            Envelope::GameResults { results } => {
                // Partner finished first; show their round from our side
                if self.results.is_none() {
                    self.show_results(GameResults {
                        compatibility: results.compatibility,
                        message: results.message,
                        self_score: results.partner_score,
                        partner_score: results.self_score,
                        self_name: results.partner_name,
                        partner_name: results.self_name,
                    });
                }
            }
            Envelope::PlayAgain => self.restart_game(),
            other => log::debug!("Ignoring {} from partner", other.tag()),
        }
    }

    fn resolve_join(&mut self) {
        let outcome = match &self.pending_join {
            Some(pending) => pending.outcome.borrow_mut().take(),
            None => return,
        };
        let outcome = match outcome {
            Some(outcome) => outcome,
            None => return,
        };

        self.clear_pending_join();
        match outcome {
            JoinOutcome::Joined => log::info!("Joined room"),
            JoinOutcome::Failed(e) => {
                log::warn!("Join failed: {}", e.kind);
                let mut message = format!("Connection error: {}", e.message);
                if e.kind == ErrorKind::PeerUnreachable {
                    message.push_str(JOIN_HELP);
                }
                self.notice(&message);
                self.to_welcome();
            }
        }
    }

    fn clear_pending_join(&mut self) {
        if let Some(pending) = self.pending_join.take() {
            self.mgr.unsubscribe(pending.established);
            self.mgr.unsubscribe(pending.error);
        }
    }

    // ------------------------------------------------------------------------
    // Screens
    // ------------------------------------------------------------------------

    fn start_game(&mut self, peer: &PlayerProfile) {
        let me = match self.mgr.local_profile() {
            Some(me) => me.clone(),
            None => return,
        };
        let random = self
            .game_random
            .take()
            .unwrap_or_else(|| Box::new(SystemRandomSource::new()));

        log::info!("Game started: {} and {}", me.name, peer.name);
        self.game = Some(GameRunner::new(
            (&me.name, &me.gender),
            (&peer.name, &peer.gender),
            self.game_duration,
            random,
        ));
        self.results = None;
        self.screen = Screen::Playing;
    }

    fn restart_game(&mut self) {
        if let Some(game) = self.game.as_mut() {
            log::info!("Starting another round");
            game.restart();
            self.results = None;
            self.screen = Screen::Playing;
        }
    }

    fn show_results(&mut self, results: GameResults) {
        log::info!(
            "Round over: {} {} / {} {}, compatibility {}%",
            results.self_name,
            results.self_score,
            results.partner_name,
            results.partner_score,
            results.compatibility
        );
        Metrics::inc(&self.metrics.games_completed_total);
        self.results = Some(results);
        self.screen = Screen::Results;
    }

    fn to_welcome(&mut self) {
        self.game = None;
        self.screen = Screen::Welcome;
    }

    fn notice(&mut self, message: &str) {
        log::info!("{}", message);
        self.notices.push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peer_link::{LoopbackEndpoint, LoopbackHub, ManagerConfig, ReconnectPolicy, SequenceRandom};
    use std::sync::atomic::Ordering;

    const STEP: Duration = Duration::from_millis(100);

    type Session = GameSession<LoopbackEndpoint>;

    fn session(hub: &LoopbackHub, seed: u32) -> Session {
        let config = ManagerConfig {
            reconnect: ReconnectPolicy {
                max_jitter: Duration::ZERO,
                ..ReconnectPolicy::default()
            },
            ..ManagerConfig::default()
        };
        let mgr = ConnectionManager::with_random(
            hub.endpoint(),
            config,
            Box::new(SequenceRandom::new(vec![seed])),
        );
        GameSession::new(mgr, "https://lovegame.example/")
            .with_game_duration(Duration::from_secs(3))
            .with_game_random(Box::new(SequenceRandom::new(vec![1])))
    }

    fn run(sessions: &mut [&mut Session], now: &mut Instant, total: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            *now += STEP;
            elapsed += STEP;
            for s in sessions.iter_mut() {
                s.tick(*now, STEP);
            }
        }
    }

    fn paired(hub: &LoopbackHub, now: &mut Instant) -> (Session, Session) {
        let mut host = session(hub, 1234);
        let mut guest = session(hub, 99);
        let room = host.create_room("Alice", "female", "real", *now);
        run(&mut [&mut host, &mut guest], now, STEP);
        guest.join_room(room, "Bob", "male", *now);
        run(&mut [&mut host, &mut guest], now, Duration::from_millis(500));
        (host, guest)
    }

    #[test]
    fn test_room_created_screen() {
        let hub = LoopbackHub::new();
        let mut host = session(&hub, 1234);
        let room = host.create_room("Alice", "female", "real", Instant::now());

        assert_eq!(room.as_str(), "LOVE-2234");
        assert_eq!(
            host.screen(),
            &Screen::RoomCreated {
                room,
                link: "https://lovegame.example/?room=LOVE-2234&host=Alice".to_string(),
            }
        );
    }

    #[test]
    fn test_full_round() {
        let hub = LoopbackHub::new();
        let mut now = Instant::now();
        let (mut host, mut guest) = paired(&hub, &mut now);

        assert_eq!(host.screen(), &Screen::Playing);
        assert_eq!(guest.screen(), &Screen::Playing);
        assert_eq!(guest.game().unwrap().partner().name, "Alice");

        run(&mut [&mut host, &mut guest], &mut now, Duration::from_secs(4));

        assert_eq!(host.screen(), &Screen::Results);
        assert_eq!(guest.screen(), &Screen::Results);
        assert_eq!(host.results().unwrap().self_name, "Alice");
        assert_eq!(host.results().unwrap().partner_name, "Bob");
        assert_eq!(guest.results().unwrap().self_name, "Bob");

        let m = host.metrics();
        assert!(m.game_updates_sent_total.load(Ordering::Relaxed) > 0);
        assert!(m.game_updates_received_total.load(Ordering::Relaxed) > 0);
        assert_eq!(m.games_completed_total.load(Ordering::Relaxed), 1);
        assert_eq!(m.sessions_established_total.load(Ordering::Relaxed), 1);

        // The join listeners are gone once resolved
        assert_eq!(guest.manager_mut().events_mut().listener_count(), 1);
    }

    #[test]
    fn test_play_again_restarts_both() {
        let hub = LoopbackHub::new();
        let mut now = Instant::now();
        let (mut host, mut guest) = paired(&hub, &mut now);
        run(&mut [&mut host, &mut guest], &mut now, Duration::from_secs(4));

        assert!(host.play_again());
        assert_eq!(host.screen(), &Screen::Playing);
        run(&mut [&mut host, &mut guest], &mut now, STEP * 2);
        assert_eq!(guest.screen(), &Screen::Playing);
        assert!(guest.results().is_none());

        // Not from the playing screen
        assert!(!guest.play_again());
    }

    #[test]
    fn test_failed_join_returns_home() {
        let hub = LoopbackHub::new();
        let mut now = Instant::now();
        let mut guest = session(&hub, 99);

        guest.join_room(Identity::new("LOVE-0000"), "Bob", "male", now);
        assert!(matches!(guest.screen(), Screen::Joining { .. }));
        run(&mut [&mut guest], &mut now, Duration::from_millis(500));

        assert_eq!(guest.screen(), &Screen::Welcome);
        let notices = guest.take_notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].contains("Could not connect to peer"));
        assert!(notices[0].contains("The room code may be incorrect"));
        assert_eq!(guest.manager_mut().events_mut().listener_count(), 1);
    }

    #[test]
    fn test_join_without_signaling_returns_home() {
        let hub = LoopbackHub::new();
        hub.set_available(false);
        let mut now = Instant::now();
        let mut guest = session(&hub, 99);

        guest.join_room(Identity::new("LOVE-1234"), "Bob", "male", now);
        run(&mut [&mut guest], &mut now, Duration::from_secs(14));
        assert!(matches!(guest.screen(), Screen::Joining { .. }));

        // No identity after 15s
        run(&mut [&mut guest], &mut now, Duration::from_secs(2));
        assert_eq!(guest.screen(), &Screen::Welcome);
        let notices = guest.take_notices();
        assert_eq!(notices.len(), 1);
        assert!(notices[0].starts_with("Connection error: "));
        assert!(!notices[0].contains("Possible reasons"));
        assert_eq!(guest.manager_mut().events_mut().listener_count(), 1);
    }

    #[test]
    fn test_partner_leaving_ends_in_welcome() {
        let hub = LoopbackHub::new();
        let mut now = Instant::now();
        let (mut host, mut guest) = paired(&hub, &mut now);

        host.leave();
        assert_eq!(host.screen(), &Screen::Welcome);

        // Attempts after 1s, 2s and 4s all find the room gone
        run(&mut [&mut guest], &mut now, Duration::from_secs(10));
        assert_eq!(guest.screen(), &Screen::Welcome);

        let notices = guest.take_notices();
        assert!(notices[0].starts_with("Connection lost. Reconnecting (1/3)"));
        assert!(notices.contains(&"Could not reconnect to your partner.".to_string()));
        assert_eq!(
            notices.last().map(String::as_str),
            Some("Your partner has disconnected. Returning to home screen.")
        );
        assert_eq!(
            guest
                .metrics()
                .reconnect_attempts_total
                .load(Ordering::Relaxed),
            3
        );
    }

    #[test]
    fn test_reconnect_resumes_round() {
        let hub = LoopbackHub::new();
        let mut now = Instant::now();
        let (mut host, mut guest) = paired(&hub, &mut now);
        let room = host.manager().room().cloned().unwrap();

        hub.sever(&room);
        run(&mut [&mut host, &mut guest], &mut now, Duration::from_millis(1500));
        assert!(host.manager().is_connected());
        assert_eq!(host.screen(), &Screen::Playing);
        assert_eq!(
            host.metrics().reconnections_total.load(Ordering::Relaxed),
            1
        );
    }
}
