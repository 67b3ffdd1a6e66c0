//! Local command execution with cooperative cancellation.
//!
//! Commands from the wake-word classifier (or matched in a transcript)
//! drive a light and a tail servo. A worker task executes them one at a
//! time; every newly posted command bumps a shared epoch token, and the
//! running action polls that token at each step boundary, aborting and
//! restoring resting state as soon as its own stamp goes stale. Queued
//! commands coalesce: only the newest instruction runs.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ActionConfig;
use crate::playback::Player;

/// Queue depth for pending action events.
const EVENT_QUEUE_DEPTH: usize = 8;

/// Slice length for interruptible delays.
const DELAY_SLICE_MS: u64 = 50;

/// Flashes in the wake acknowledgment blink.
const WAKE_BLINK_COUNT: u32 = 2;

/// Local command vocabulary, in classifier id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    LightOn,
    LightOff,
    Forward,
    Backward,
    TailSwing,
}

impl Command {
    /// Map a classifier command id (0..=4).
    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            0 => Some(Command::LightOn),
            1 => Some(Command::LightOff),
            2 => Some(Command::Forward),
            3 => Some(Command::Backward),
            4 => Some(Command::TailSwing),
            _ => None,
        }
    }

    /// Keyword-match a transcript; first hit wins.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.to_lowercase();
        if text.contains("light on") {
            return Some(Command::LightOn);
        }
        if text.contains("light off") {
            return Some(Command::LightOff);
        }
        if text.contains("forward") {
            return Some(Command::Forward);
        }
        if text.contains("backward") || text.contains("back up") {
            return Some(Command::Backward);
        }
        if text.contains("tail") {
            return Some(Command::TailSwing);
        }
        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::LightOn => "light_on",
            Command::LightOff => "light_off",
            Command::Forward => "forward",
            Command::Backward => "backward",
            Command::TailSwing => "tail_swing",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Narrow actuator interface: a discrete light and a continuous tail
/// servo position in degrees.
pub trait Actuators {
    fn set_light(&mut self, on: bool);
    fn set_tail_angle(&mut self, degrees: f32);
}

/// Shared cancellation epoch. Bumped on every posted command; running
/// actions compare their captured stamp against it at yield points.
#[derive(Clone)]
pub struct ActionToken {
    epoch: Arc<AtomicU32>,
}

impl ActionToken {
    fn new() -> Self {
        Self {
            epoch: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Invalidate running actions and return the stamp for the next one.
    pub fn bump(&self) -> u32 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u32 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// True when a captured stamp is no longer the newest command's.
    pub fn is_stale(&self, stamp: u32) -> bool {
        self.current() != stamp
    }
}

enum ActionEvent {
    Wake { stamp: u32 },
    Command { command: Command, stamp: u32 },
}

/// Handle for posting wake blinks and commands to the action worker.
#[derive(Clone)]
pub struct ActionDispatcher {
    token: ActionToken,
    tx: mpsc::Sender<ActionEvent>,
}

impl ActionDispatcher {
    /// Start the action worker. `celebration` is the WAV asset played by
    /// the tail-swing move; `observer` is invoked after each executed
    /// command.
    pub fn spawn<A>(
        cfg: ActionConfig,
        actuators: A,
        player: Player,
        celebration: &'static [u8],
        observer: impl Fn(Command) + Send + Sync + 'static,
    ) -> Self
    where
        A: Actuators + Send + Sync + 'static,
    {
        let token = ActionToken::new();
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let tail_angle = cfg.servo_center_angle;
        let worker = Worker {
            cfg,
            token: token.clone(),
            actuators,
            player,
            celebration,
            observer: Box::new(observer),
            light_on: false,
            tail_angle,
        };
        tokio::spawn(worker.run(rx));
        Self { token, tx }
    }

    /// Queue the wake acknowledgment blink.
    pub fn post_wake(&self) {
        let ev = ActionEvent::Wake {
            stamp: self.token.current(),
        };
        if self.tx.try_send(ev).is_err() {
            warn!("Action queue full, dropping wake blink");
        }
    }

    /// Invalidate any running action and queue `command`.
    pub fn post_command(&self, command: Command) {
        let stamp = self.token.bump();
        let ev = ActionEvent::Command { command, stamp };
        if self.tx.try_send(ev).is_err() {
            // the bump alone already cancelled the running action
            warn!(command = %command, "Action queue full, dropping command");
        }
    }

    pub fn token(&self) -> ActionToken {
        self.token.clone()
    }
}

struct Worker<A: Actuators> {
    cfg: ActionConfig,
    token: ActionToken,
    actuators: A,
    player: Player,
    celebration: &'static [u8],
    observer: Box<dyn Fn(Command) + Send + Sync>,
    light_on: bool,
    tail_angle: f32,
}

impl<A: Actuators + Send + 'static> Worker<A> {
    async fn run(mut self, mut rx: mpsc::Receiver<ActionEvent>) {
        debug!("Action worker started");
        while let Some(mut ev) = rx.recv().await {
            // coalesce queued commands; only the newest instruction runs
            if matches!(ev, ActionEvent::Command { .. }) {
                while let Ok(next) = rx.try_recv() {
                    if matches!(next, ActionEvent::Command { .. }) {
                        ev = next;
                    }
                }
            }
            match ev {
                ActionEvent::Wake { stamp } => {
                    self.blink_light(WAKE_BLINK_COUNT, self.cfg.flash_delay_ms, stamp)
                        .await
                }
                ActionEvent::Command { command, stamp } => self.execute(command, stamp).await,
            }
        }
        debug!("Action worker stopped");
    }

    async fn execute(&mut self, command: Command, stamp: u32) {
        if self.token.is_stale(stamp) {
            return;
        }
        info!(command = %command, "Executing local command");
        match command {
            Command::LightOn => self.set_light(true),
            Command::LightOff => self.set_light(false),
            Command::Forward => {
                self.point_tail(self.cfg.servo_center_angle + self.cfg.servo_rotate_angle)
            }
            Command::Backward => {
                self.point_tail(self.cfg.servo_center_angle - self.cfg.servo_rotate_angle)
            }
            Command::TailSwing => self.tail_swing(stamp).await,
        }
        (self.observer)(command);
    }

    fn set_light(&mut self, on: bool) {
        self.actuators.set_light(on);
        self.light_on = on;
    }

    fn point_tail(&mut self, degrees: f32) {
        let clamped = degrees.clamp(0.0, 180.0);
        self.actuators.set_tail_angle(clamped);
        self.tail_angle = clamped;
    }

    /// The celebration move: the tail swings while the light flashes and
    /// the roar sound plays. Interruptible at every slice; resting state
    /// is always restored.
    async fn tail_swing(&mut self, stamp: u32) {
        let saved_light = self.light_on;

        if let Err(e) = self.player.play_asset(self.celebration).await {
            warn!("Celebration sound failed: {}", e);
        }

        let swing_steps = self.cfg.servo_swing_count * 2;
        let flash_steps = self.cfg.led_flash_count * 2;
        let total_steps = swing_steps.max(flash_steps);
        let step_delay = self.cfg.swing_delay_ms.max(self.cfg.flash_delay_ms);

        let mut swing_right = true;
        let mut light_on = true;
        for step in 0..total_steps {
            if self.token.is_stale(stamp) {
                break;
            }
            if step < swing_steps {
                let angle = if swing_right {
                    self.cfg.servo_center_angle + self.cfg.servo_rotate_angle
                } else {
                    self.cfg.servo_center_angle - self.cfg.servo_rotate_angle
                };
                self.point_tail(angle);
                swing_right = !swing_right;
            }
            if step < flash_steps {
                self.set_light(light_on);
                light_on = !light_on;
            }
            self.sliced_delay(step_delay, stamp).await;
        }

        // a newer command must not keep the roar going
        if self.token.is_stale(stamp) {
            self.player.stop();
        }

        self.point_tail(self.cfg.servo_center_angle);
        self.set_light(saved_light);
    }

    /// Short acknowledgment blink on wake; the previous light state is
    /// restored afterwards.
    async fn blink_light(&mut self, count: u32, delay_ms: u64, stamp: u32) {
        let saved = self.light_on;
        let mut on = true;
        for _ in 0..count * 2 {
            if self.token.is_stale(stamp) {
                break;
            }
            self.set_light(on);
            on = !on;
            self.sliced_delay(delay_ms, stamp).await;
        }
        self.set_light(saved);
    }

    /// Sleep in short slices so a newer command interrupts mid-wait.
    async fn sliced_delay(&self, total_ms: u64, stamp: u32) {
        let mut remain = total_ms;
        while remain > 0 && !self.token.is_stale(stamp) {
            let slice = remain.min(DELAY_SLICE_MS);
            tokio::time::sleep(Duration::from_millis(slice)).await;
            remain -= slice;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav;
    use crate::config::PlaybackConfig;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Op {
        Light(bool),
        Tail(f32),
    }

    #[derive(Clone, Default)]
    struct MockActuators {
        ops: Arc<Mutex<Vec<Op>>>,
    }

    impl Actuators for MockActuators {
        fn set_light(&mut self, on: bool) {
            self.ops.lock().unwrap().push(Op::Light(on));
        }
        fn set_tail_angle(&mut self, degrees: f32) {
            self.ops.lock().unwrap().push(Op::Tail(degrees));
        }
    }

    fn fast_cfg() -> ActionConfig {
        ActionConfig {
            flash_delay_ms: 40,
            swing_delay_ms: 60,
            ..ActionConfig::default()
        }
    }

    fn test_player() -> Player {
        Player::spawn_null(&PlaybackConfig::default()).unwrap()
    }

    fn roar() -> &'static [u8] {
        Box::leak(wav::encode_wav(&vec![80i16; 480], 16_000).into_boxed_slice())
    }

    fn spawn_with(
        cfg: ActionConfig,
    ) -> (ActionDispatcher, MockActuators, Arc<Mutex<Vec<Command>>>) {
        let actuators = MockActuators::default();
        let executed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&executed);
        let dispatcher = ActionDispatcher::spawn(
            cfg,
            actuators.clone(),
            test_player(),
            roar(),
            move |cmd| sink.lock().unwrap().push(cmd),
        );
        (dispatcher, actuators, executed)
    }

    #[test]
    fn classifier_ids_map_to_commands() {
        assert_eq!(Command::from_id(0), Some(Command::LightOn));
        assert_eq!(Command::from_id(4), Some(Command::TailSwing));
        assert_eq!(Command::from_id(5), None);
        assert_eq!(Command::from_id(-1), None);
    }

    #[test]
    fn transcripts_match_keywords() {
        assert_eq!(Command::parse("turn the light on"), Some(Command::LightOn));
        assert_eq!(Command::parse("Light off please"), Some(Command::LightOff));
        assert_eq!(Command::parse("go forward"), Some(Command::Forward));
        assert_eq!(Command::parse("swing your tail"), Some(Command::TailSwing));
        assert_eq!(Command::parse("what time is it"), None);
    }

    #[test]
    fn token_stamps_go_stale_on_bump() {
        let token = ActionToken::new();
        let stamp = token.bump();
        assert!(!token.is_stale(stamp));
        token.bump();
        assert!(token.is_stale(stamp));
    }

    #[tokio::test]
    async fn discrete_commands_drive_actuators() {
        let (dispatcher, actuators, executed) = spawn_with(fast_cfg());

        dispatcher.post_command(Command::LightOn);
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.post_command(Command::Forward);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ops = actuators.ops.lock().unwrap().clone();
        assert_eq!(ops, vec![Op::Light(true), Op::Tail(180.0)]);
        assert_eq!(
            executed.lock().unwrap().clone(),
            vec![Command::LightOn, Command::Forward]
        );
    }

    #[tokio::test]
    async fn stale_token_halts_swing_and_restores_resting_state() {
        let (dispatcher, actuators, _executed) = spawn_with(fast_cfg());
        let started = Instant::now();

        dispatcher.post_command(Command::TailSwing);
        tokio::time::sleep(Duration::from_millis(130)).await;
        dispatcher.post_command(Command::LightOff);

        tokio::time::sleep(Duration::from_millis(250)).await;
        // a full swing is 10 steps at 60 ms; pre-emption cut it short
        assert!(started.elapsed() < Duration::from_millis(500));

        let ops = actuators.ops.lock().unwrap().clone();
        let last_tail = ops
            .iter()
            .rev()
            .find_map(|op| match op {
                Op::Tail(angle) => Some(*angle),
                _ => None,
            })
            .unwrap();
        assert_eq!(last_tail, 90.0);
        assert_eq!(ops.last(), Some(&Op::Light(false)));
    }

    #[tokio::test]
    async fn queued_commands_coalesce_to_newest() {
        let (dispatcher, _actuators, executed) = spawn_with(fast_cfg());

        // keep the worker busy in the wake blink, then pile up commands
        dispatcher.post_wake();
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.post_command(Command::LightOn);
        dispatcher.post_command(Command::LightOff);
        dispatcher.post_command(Command::Forward);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(executed.lock().unwrap().clone(), vec![Command::Forward]);
    }

    #[tokio::test]
    async fn wake_blink_restores_prior_light_state() {
        let (dispatcher, actuators, executed) = spawn_with(fast_cfg());

        dispatcher.post_command(Command::LightOn);
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.post_wake();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let ops = actuators.ops.lock().unwrap().clone();
        assert_eq!(ops.last(), Some(&Op::Light(true)));
        assert_eq!(executed.lock().unwrap().clone(), vec![Command::LightOn]);
    }
}
