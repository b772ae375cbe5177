//! Headless Love Run round
//!
//! Each player runs their own round locally and streams `game-update`
//! snapshots to the partner; the partner's snapshots only update the
//! partner's displayed state. Hearts spawn every second in a high or low
//! band and are collected when the runner is in that band. Obstacles spawn
//! every two seconds and cost a heart unless the runner is airborne.

use std::time::Duration;

use peer_link::{GameData, GameResults, RandomSource};

/// Length of one round
pub const GAME_DURATION: Duration = Duration::from_secs(60);

/// Theoretical maximum of hearts collected by both players together
pub const MAX_POSSIBLE_HEARTS: u32 = 100;

const HEART_SPAWN_INTERVAL: Duration = Duration::from_millis(1000);
const OBSTACLE_SPAWN_INTERVAL: Duration = Duration::from_millis(2000);

const GROUND_Y: f64 = 320.0;
const JUMP_FORCE: f64 = 15.0;
const GRAVITY: f64 = 0.8;
const SELF_START_X: f64 = 50.0;
const PARTNER_START_X: f64 = 150.0;

/// Love compatibility of a couple: collected hearts out of the maximum, capped at 100
pub fn compatibility(self_score: u32, partner_score: u32) -> u32 {
    let total = (self_score + partner_score) as f64;
    let pct = (total / MAX_POSSIBLE_HEARTS as f64 * 100.0).round() as u32;
    pct.min(100)
}

pub fn result_message(compatibility: u32) -> &'static str {
    if compatibility >= 90 {
        "You are today's Perfect Couple!"
    } else if compatibility >= 70 {
        "Amazing chemistry between you two!"
    } else if compatibility >= 50 {
        "You make a lovely couple!"
    } else if compatibility >= 30 {
        "There's potential for more love!"
    } else {
        "Keep working on your relationship!"
    }
}

/// Text for sharing a result
pub fn share_text(results: &GameResults) -> String {
    format!(
        "{} and {} have a Love Compatibility of {}%! {} Play Love Run now!",
        results.self_name, results.partner_name, results.compatibility, results.message
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct Runner {
    pub name: String,
    pub gender: String,
    pub x: f64,
    pub y: f64,
    pub velocity: f64,
    pub is_jumping: bool,
    pub score: u32,
}

impl Runner {
    fn new(name: &str, gender: &str, x: f64) -> Self {
        Self {
            name: name.to_string(),
            gender: gender.to_string(),
            x,
            y: GROUND_Y,
            velocity: 0.0,
            is_jumping: false,
            score: 0,
        }
    }

    fn step(&mut self) {
        if !self.is_jumping {
            return;
        }
        self.y += self.velocity;
        self.velocity += GRAVITY;
        if self.y >= GROUND_Y {
            self.y = GROUND_Y;
            self.velocity = 0.0;
            self.is_jumping = false;
        }
    }
}

/// Outcome of advancing the round
#[derive(Debug, Clone, PartialEq)]
pub enum GameTick {
    /// Snapshot to send to the partner
    Update(GameData),
    /// Time is up; reported once
    Finished(GameResults),
    /// Round not running
    Idle,
}

pub struct GameRunner {
    me: Runner,
    partner: Runner,
    duration: Duration,
    remaining: Duration,
    heart_timer: Duration,
    obstacle_timer: Duration,
    running: bool,
    random: Box<dyn RandomSource>,
}

impl GameRunner {
    /// `me` and `partner` are (name, gender)
    pub fn new(
        me: (&str, &str),
        partner: (&str, &str),
        duration: Duration,
        random: Box<dyn RandomSource>,
    ) -> Self {
        Self {
            me: Runner::new(me.0, me.1, SELF_START_X),
            partner: Runner::new(partner.0, partner.1, PARTNER_START_X),
            duration,
            remaining: duration,
            heart_timer: Duration::ZERO,
            obstacle_timer: Duration::ZERO,
            running: true,
            random,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    pub fn me(&self) -> &Runner {
        &self.me
    }

    pub fn partner(&self) -> &Runner {
        &self.partner
    }

    /// Start the round over with the same players
    pub fn restart(&mut self) {
        let me = Runner::new(&self.me.name, &self.me.gender, SELF_START_X);
        let partner = Runner::new(&self.partner.name, &self.partner.gender, PARTNER_START_X);
        self.me = me;
        self.partner = partner;
        self.remaining = self.duration;
        self.heart_timer = Duration::ZERO;
        self.obstacle_timer = Duration::ZERO;
        self.running = true;
    }

    pub fn jump(&mut self) {
        if !self.me.is_jumping {
            self.me.is_jumping = true;
            self.me.velocity = -JUMP_FORCE;
        }
    }

    pub fn tick(&mut self, dt: Duration) -> GameTick {
        if !self.running {
            return GameTick::Idle;
        }
        if dt >= self.remaining {
            self.remaining = Duration::ZERO;
            self.running = false;
            return GameTick::Finished(self.results());
        }
        self.remaining -= dt;

        self.me.step();

        self.heart_timer += dt;
        while self.heart_timer >= HEART_SPAWN_INTERVAL {
            self.heart_timer -= HEART_SPAWN_INTERVAL;
            let high = self.random.next_u32() % 2 == 0;
            if high == self.me.is_jumping {
                self.me.score += 1;
            }
        }

        self.obstacle_timer += dt;
        while self.obstacle_timer >= OBSTACLE_SPAWN_INTERVAL {
            self.obstacle_timer -= OBSTACLE_SPAWN_INTERVAL;
            if !self.me.is_jumping {
                self.me.score = self.me.score.saturating_sub(1);
            }
        }

        GameTick::Update(self.snapshot())
    }

    pub fn snapshot(&self) -> GameData {
        GameData {
            player_x: self.me.x,
            player_y: self.me.y,
            score: self.me.score,
            is_jumping: self.me.is_jumping,
        }
    }

    pub fn apply_partner(&mut self, data: &GameData) {
        self.partner.x = data.player_x;
        self.partner.y = data.player_y;
        self.partner.score = data.score;
        self.partner.is_jumping = data.is_jumping;
    }

    /// In-game encouragement based on the score difference
    pub fn feedback(&self) -> &'static str {
        let diff = self.me.score as i64 - self.partner.score as i64;
        if diff > 5 {
            "You're pulling ahead in love!"
        } else if diff < -5 {
            "Your lover is catching up! Hurry!"
        } else if diff >= 0 {
            "You're neck and neck in love!"
        } else {
            "Don't give up! Collect more hearts!"
        }
    }

    pub fn results(&self) -> GameResults {
        let compatibility = compatibility(self.me.score, self.partner.score);
        GameResults {
            compatibility,
            message: result_message(compatibility).to_string(),
            self_score: self.me.score,
            partner_score: self.partner.score,
            self_name: self.me.name.clone(),
            partner_name: self.partner.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peer_link::SequenceRandom;

    fn runner(values: Vec<u32>, duration: Duration) -> GameRunner {
        GameRunner::new(
            ("Alice", "female"),
            ("Bob", "male"),
            duration,
            Box::new(SequenceRandom::new(values)),
        )
    }

    #[test]
    fn test_compatibility_formula() {
        assert_eq!(compatibility(0, 0), 0);
        assert_eq!(compatibility(20, 25), 45);
        assert_eq!(compatibility(60, 60), 100);
    }

    #[test]
    fn test_result_thresholds() {
        assert_eq!(result_message(95), "You are today's Perfect Couple!");
        assert_eq!(result_message(90), "You are today's Perfect Couple!");
        assert_eq!(result_message(89), "Amazing chemistry between you two!");
        assert_eq!(result_message(70), "Amazing chemistry between you two!");
        assert_eq!(result_message(50), "You make a lovely couple!");
        assert_eq!(result_message(30), "There's potential for more love!");
        assert_eq!(result_message(29), "Keep working on your relationship!");
    }

    #[test]
    fn test_low_hearts_collected_on_ground() {
        // Odd values spawn low hearts
        let mut game = runner(vec![1], GAME_DURATION);
        game.tick(Duration::from_millis(1000));
        assert_eq!(game.me().score, 1);

        // Second heart, then the obstacle at 2s takes one back
        game.tick(Duration::from_millis(1000));
        assert_eq!(game.me().score, 1);
    }

    #[test]
    fn test_obstacle_never_goes_negative() {
        let mut game = runner(vec![0], GAME_DURATION);
        game.tick(Duration::from_millis(2000));
        assert_eq!(game.me().score, 0);
    }

    #[test]
    fn test_jump_lands_again() {
        let mut game = runner(vec![1], GAME_DURATION);
        game.jump();
        assert!(game.me().is_jumping);

        for _ in 0..40 {
            game.tick(Duration::from_millis(10));
        }
        assert!(!game.me().is_jumping);
        assert_eq!(game.me().y, GROUND_Y);
    }

    #[test]
    fn test_round_finishes_once() {
        let mut game = runner(vec![1], Duration::from_secs(3));
        assert!(matches!(game.tick(Duration::from_secs(1)), GameTick::Update(_)));
        assert!(matches!(game.tick(Duration::from_secs(1)), GameTick::Update(_)));

        match game.tick(Duration::from_secs(1)) {
            GameTick::Finished(results) => {
                assert_eq!(results.self_name, "Alice");
                assert_eq!(results.partner_name, "Bob");
            }
            other => panic!("expected finish, got {:?}", other),
        }
        assert_eq!(game.tick(Duration::from_secs(1)), GameTick::Idle);

        game.restart();
        assert!(game.is_running());
        assert_eq!(game.remaining(), Duration::from_secs(3));
    }

    #[test]
    fn test_partner_updates_feedback() {
        let mut game = runner(vec![1], GAME_DURATION);
        assert_eq!(game.feedback(), "You're neck and neck in love!");

        game.apply_partner(&GameData {
            player_x: 10.0,
            player_y: 300.0,
            score: 8,
            is_jumping: true,
        });
        assert_eq!(game.partner().score, 8);
        assert_eq!(game.feedback(), "Your lover is catching up! Hurry!");
        assert_eq!(game.results().compatibility, 8);
    }

    #[test]
    fn test_share_text() {
        let results = GameResults {
            compatibility: 72,
            message: result_message(72).to_string(),
            self_score: 40,
            partner_score: 32,
            self_name: "Alice".to_string(),
            partner_name: "Bob".to_string(),
        };
        assert_eq!(
            share_text(&results),
            "Alice and Bob have a Love Compatibility of 72%! Amazing chemistry between you two! Play Love Run now!"
        );
    }
}
