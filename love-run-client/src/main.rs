//! Love Run Client
//!
//! Plays one headless round between two local clients:
//! - A host creates a room and waits for its partner
//! - A guest joins with the room code
//! - Both run the round on autopilot, exchanging game updates
//! - Optionally drops the link mid-round to exercise reconnection
//!
//! Both clients share an in-process rendezvous hub and run in real time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use peer_link::{
    ConnectionManager, LoopbackEndpoint, LoopbackHub, ManagerConfig, RandomSource,
    SystemRandomSource,
};

mod game;
mod metrics;
mod session;

use game::share_text;
use session::{GameSession, Screen};

// ============================================================================
// Constants
// ============================================================================

/// Frame length of the real-time loop
const FRAME: Duration = Duration::from_millis(100);

/// Page the invite link points at
const BASE_URL: &str = "https://lovegame.example/";

/// How often the host's in-game feedback is logged
const FEEDBACK_INTERVAL: Duration = Duration::from_secs(10);

/// One autopilot jump per this many frames, on average
const JUMP_ODDS: u32 = 8;

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    // --config <path>        Manager config (JSON, durations in ms)
    // --max-attempts <n>     Reconnection attempt budget
    // --name <name>          Host player name
    // --partner <name>       Guest player name
    // --duration <secs>      Round length
    // --drop-at <secs>       Sever the link this long after start

    let mut config = match parse_arg(&args, "--config") {
        Some(path) => ManagerConfig::from_json(&std::fs::read_to_string(&path)?)?,
        None => ManagerConfig::default(),
    };
    if let Some(n) = parse_arg(&args, "--max-attempts") {
        config.reconnect.max_attempts = n.parse().map_err(|_| "Invalid --max-attempts")?;
        config.validate()?;
    }

    let name = parse_arg(&args, "--name").unwrap_or_else(|| "Alice".to_string());
    let partner = parse_arg(&args, "--partner").unwrap_or_else(|| "Bob".to_string());
    let duration = match parse_arg(&args, "--duration") {
        Some(secs) => Duration::from_secs(secs.parse().map_err(|_| "Invalid --duration")?),
        None => game::GAME_DURATION,
    };
    let drop_at = match parse_arg(&args, "--drop-at") {
        Some(secs) => Some(Duration::from_secs_f64(
            secs.parse().map_err(|_| "Invalid --drop-at")?,
        )),
        None => None,
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    log::info!("Love Run client starting...");
    log::info!("  Host:      {}", name);
    log::info!("  Guest:     {}", partner);
    log::info!("  Round:     {:?}", duration);
    log::info!("  Reconnect: {} attempts", config.reconnect.max_attempts);
    if let Some(at) = drop_at {
        log::info!("  Drop at:   {:?}", at);
    }

    let hub = LoopbackHub::new();
    let host_mgr = ConnectionManager::new(hub.endpoint(), config.clone());
    let guest_mgr = ConnectionManager::new(hub.endpoint(), config);
    let mut host = GameSession::new(host_mgr, BASE_URL).with_game_duration(duration);
    let mut guest = GameSession::new(guest_mgr, BASE_URL).with_game_duration(duration);

    if !run(&hub, &mut host, &mut guest, &name, &partner, drop_at, &shutdown) {
        log::warn!("Session ended before the round finished");
    }

    for (label, session) in [("Host", &host), ("Guest", &guest)] {
        if let Some(results) = session.results() {
            log::info!("{} results: {}", label, serde_json::to_string(results)?);
            log::info!("{}", share_text(results));
        }
        log::info!("{} metrics:\n{}", label, session.metrics().render());
    }

    guest.leave();
    host.leave();
    log::info!("Love Run client stopped");
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

// ============================================================================
// Event Loop
// ============================================================================

type Session = GameSession<LoopbackEndpoint>;

/// Run until both clients show results; false if a client fell back home
fn run(
    hub: &LoopbackHub,
    host: &mut Session,
    guest: &mut Session,
    host_name: &str,
    guest_name: &str,
    drop_at: Option<Duration>,
    shutdown: &AtomicBool,
) -> bool {
    let start = Instant::now();
    let room = host.create_room(host_name, "female", "real", start);

    let mut autopilot = SystemRandomSource::new();
    let mut joined = false;
    let mut dropped = false;
    let mut last = start;
    let mut last_feedback = start;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            log::info!("Shutdown requested");
            return true;
        }

        std::thread::sleep(FRAME);
        let now = Instant::now();
        let dt = now - last;
        last = now;

        host.tick(now, dt);
        // Join once the room is reachable
        if !joined && hub.is_registered(&room) {
            guest.join_room(room.clone(), guest_name, "male", now);
            joined = true;
        }
        guest.tick(now, dt);

        for session in [&mut *host, &mut *guest] {
            if *session.screen() == Screen::Playing && autopilot.next_u32() % JUMP_ODDS == 0 {
                session.jump();
            }
            // Notices are already in the log
            session.take_notices();
        }

        if let (Some(at), false) = (drop_at, dropped) {
            if now - start >= at && host.manager().is_connected() {
                log::warn!("Dropping the link to {}", room);
                hub.sever(&room);
                dropped = true;
            }
        }

        if now - last_feedback >= FEEDBACK_INTERVAL {
            last_feedback = now;
            if let Some(game) = host.game().filter(|g| g.is_running()) {
                log::info!(
                    "{} {} vs {} {}, {:?} left: {}",
                    game.me().name,
                    game.me().score,
                    game.partner().name,
                    game.partner().score,
                    game.remaining(),
                    game.feedback()
                );
            }
        }

        if *host.screen() == Screen::Results && *guest.screen() == Screen::Results {
            log::info!("Round complete");
            return true;
        }
        if *host.screen() == Screen::Welcome || (joined && *guest.screen() == Screen::Welcome) {
            return false;
        }
    }
}
