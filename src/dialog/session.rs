//! Atomic wake/dialog state machine.
//!
//! Thread-safe state tracking shared between the detection loop, the
//! upload worker, and the host command handler. Transitions are guarded
//! compare-exchanges so racing callers cannot skip states.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Wake controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WakeState {
    /// Controller not started; detections are discarded.
    Idle = 0,
    /// Waiting for the wake phrase. The only state that accepts a wake
    /// event.
    Running = 1,
    /// Wake event accepted, session setup in progress.
    Detected = 2,
    /// Fixed-duration window running local command classification only.
    ListeningCommand = 3,
    /// Continuous dialog session is open.
    Dialog = 4,
}

impl WakeState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Detected,
            3 => Self::ListeningCommand,
            4 => Self::Dialog,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for WakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Detected => write!(f, "detected"),
            Self::ListeningCommand => write!(f, "listening_command"),
            Self::Dialog => write!(f, "dialog"),
        }
    }
}

/// Thread-safe wake state, shareable via `Arc`.
#[derive(Debug)]
pub struct WakeStateMachine {
    state: AtomicU8,
}

impl WakeStateMachine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(WakeState::Idle as u8),
        })
    }

    pub fn current(&self) -> WakeState {
        WakeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Begin accepting wake events (from Idle).
    pub fn start(&self) -> bool {
        self.transition(WakeState::Idle, WakeState::Running)
    }

    /// Accept a wake event. Fails unless currently Running, which is what
    /// keeps a second wake phrase from re-triggering mid-session.
    pub fn wake_detected(&self) -> bool {
        self.transition(WakeState::Running, WakeState::Detected)
    }

    /// Open a dialog session after a wake event.
    pub fn enter_dialog(&self) -> bool {
        self.transition(WakeState::Detected, WakeState::Dialog)
    }

    /// Open a local-command window after a wake event.
    pub fn enter_command_window(&self) -> bool {
        self.transition(WakeState::Detected, WakeState::ListeningCommand)
    }

    /// Close the dialog session and resume waiting for the wake phrase.
    pub fn end_session(&self) -> bool {
        self.transition(WakeState::Dialog, WakeState::Running)
    }

    /// Close the command window and resume waiting for the wake phrase.
    pub fn end_command_window(&self) -> bool {
        self.transition(WakeState::ListeningCommand, WakeState::Running)
    }

    /// Force back to Idle (shutdown).
    pub fn stop(&self) {
        self.state.store(WakeState::Idle as u8, Ordering::Release);
    }

    fn transition(&self, from: WakeState, to: WakeState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Shared per-session flags and timers.
///
/// Tick values are monotonic milliseconds supplied by the caller (the
/// engine measures them from its own start instant), which keeps the
/// watchdog arithmetic deterministic under test.
#[derive(Debug, Default)]
pub struct DialogSession {
    active: AtomicBool,
    turn_busy: AtomicBool,
    last_activity_ms: AtomicU64,
    exit_requested: AtomicBool,
    ignore_until_ms: AtomicU64,
}

impl DialogSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open the session at the given tick with all gates cleared.
    pub fn begin(&self, now_ms: u64) {
        self.turn_busy.store(false, Ordering::Release);
        self.exit_requested.store(false, Ordering::Release);
        self.ignore_until_ms.store(0, Ordering::Release);
        self.last_activity_ms.store(now_ms, Ordering::Release);
        self.active.store(true, Ordering::Release);
    }

    /// Tear the session down, clearing every gate.
    pub fn end(&self) {
        self.active.store(false, Ordering::Release);
        self.turn_busy.store(false, Ordering::Release);
        self.exit_requested.store(false, Ordering::Release);
        self.ignore_until_ms.store(0, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Refresh the inactivity watchdog.
    pub fn touch(&self, now_ms: u64) {
        self.last_activity_ms.store(now_ms, Ordering::Release);
    }

    /// Milliseconds since the watchdog was last refreshed.
    pub fn idle_for(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_activity_ms.load(Ordering::Acquire))
    }

    /// Claim the single-turn gate. Exactly one caller wins until
    /// `end_turn` releases it.
    pub fn try_begin_turn(&self) -> bool {
        self.turn_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_turn(&self) {
        self.turn_busy.store(false, Ordering::Release);
    }

    pub fn is_turn_busy(&self) -> bool {
        self.turn_busy.load(Ordering::Acquire)
    }

    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::Release);
    }

    /// Consume a pending exit request, if any.
    pub fn take_exit_request(&self) -> bool {
        self.exit_requested.swap(false, Ordering::AcqRel)
    }

    /// Suppress segmenter input until `now_ms + window_ms` so the device
    /// does not transcribe its own confirmation sound.
    pub fn suppress_input_for(&self, now_ms: u64, window_ms: u64) {
        self.ignore_until_ms
            .store(now_ms + window_ms, Ordering::Release);
    }

    pub fn input_suppressed(&self, now_ms: u64) -> bool {
        now_ms < self.ignore_until_ms.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_only_accepted_while_running() {
        let m = WakeStateMachine::new();
        assert!(!m.wake_detected()); // still Idle
        assert!(m.start());
        assert!(m.wake_detected());
        assert_eq!(m.current(), WakeState::Detected);
        assert!(!m.wake_detected()); // no re-trigger mid-session
    }

    #[test]
    fn dialog_round_trip() {
        let m = WakeStateMachine::new();
        assert!(m.start());
        assert!(m.wake_detected());
        assert!(m.enter_dialog());
        assert_eq!(m.current(), WakeState::Dialog);
        assert!(m.end_session());
        assert_eq!(m.current(), WakeState::Running);
        // A fresh wake works again after teardown.
        assert!(m.wake_detected());
    }

    #[test]
    fn command_window_round_trip() {
        let m = WakeStateMachine::new();
        assert!(m.start());
        assert!(m.wake_detected());
        assert!(m.enter_command_window());
        assert!(!m.end_session()); // wrong teardown path rejected
        assert!(m.end_command_window());
        assert_eq!(m.current(), WakeState::Running);
    }

    #[test]
    fn turn_gate_admits_one_winner() {
        let s = DialogSession::new();
        s.begin(0);
        assert!(s.try_begin_turn());
        assert!(!s.try_begin_turn());
        assert!(s.is_turn_busy());
        s.end_turn();
        assert!(s.try_begin_turn());
    }

    #[test]
    fn exit_request_consumed_once() {
        let s = DialogSession::new();
        s.begin(0);
        assert!(!s.take_exit_request());
        s.request_exit();
        assert!(s.take_exit_request());
        assert!(!s.take_exit_request());
    }

    #[test]
    fn watchdog_arithmetic() {
        let s = DialogSession::new();
        s.begin(1_000);
        assert_eq!(s.idle_for(1_250), 250);
        s.touch(2_000);
        assert_eq!(s.idle_for(2_100), 100);
        // Tick races backwards are clamped, never underflow.
        assert_eq!(s.idle_for(1_900), 0);
    }

    #[test]
    fn ignore_window_expires() {
        let s = DialogSession::new();
        s.begin(0);
        assert!(!s.input_suppressed(0));
        s.suppress_input_for(100, 200);
        assert!(s.input_suppressed(100));
        assert!(s.input_suppressed(299));
        assert!(!s.input_suppressed(300));
    }

    #[test]
    fn end_clears_all_gates() {
        let s = DialogSession::new();
        s.begin(0);
        assert!(s.try_begin_turn());
        s.request_exit();
        s.suppress_input_for(0, 10_000);
        s.end();
        assert!(!s.is_active());
        assert!(!s.is_turn_busy());
        assert!(!s.take_exit_request());
        assert!(!s.input_suppressed(5_000));
    }
}
