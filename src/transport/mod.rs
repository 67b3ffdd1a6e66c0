//! Dialog service transports.
//!
//! One logical conversation turn rides either a persistent WebSocket
//! session (`ws`, streaming) or a single HTTP request carrying a WAV body
//! (`http`, batch fallback). Both share the connection lifecycle tracked
//! by [`TransportCell`]; the batch client simply never leaves the early
//! states.

pub mod http;
pub mod wire;
pub mod ws;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::{Error, Result};

/// Connection lifecycle states, strictly ordered. Protocol requests are
/// only legal from `Connected` onward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TransportState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Listening = 3,
    WaitingForResponse = 4,
    Speaking = 5,
}

impl TransportState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Listening,
            4 => Self::WaitingForResponse,
            5 => Self::Speaking,
            _ => Self::Idle,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Listening => "listening",
            Self::WaitingForResponse => "waiting_for_response",
            Self::Speaking => "speaking",
        }
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thread-safe transport state cell shared between the I/O task and the
/// callers issuing protocol requests. Every transition is guarded so an
/// out-of-order request is rejected without side effects.
#[derive(Debug, Default)]
pub struct TransportCell {
    state: AtomicU8,
}

impl TransportCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn current(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Idle -> Connecting.
    pub fn begin_connect(&self) -> bool {
        self.transition(TransportState::Idle, TransportState::Connecting)
    }

    /// Handshake acknowledged by the service; the session is usable.
    pub fn hello_complete(&self) {
        self.state
            .store(TransportState::Connected as u8, Ordering::Release);
    }

    /// Connected -> Listening.
    pub fn try_start_listening(&self) -> Result<()> {
        self.guarded("start_listening", TransportState::Connected, TransportState::Listening)
    }

    /// Listening -> WaitingForResponse.
    pub fn try_stop_listening(&self) -> Result<()> {
        self.guarded(
            "stop_listening",
            TransportState::Listening,
            TransportState::WaitingForResponse,
        )
    }

    /// Binary audio is legal only while Listening.
    pub fn check_send_audio(&self) -> Result<()> {
        let state = self.current();
        if state == TransportState::Listening {
            Ok(())
        } else {
            Err(Error::InvalidState {
                op: "send_audio",
                state: state.as_str(),
            })
        }
    }

    /// Abort is legal from Connected onward and does not itself change
    /// state; the service answers with a tts stop or a disconnect.
    pub fn check_abort(&self) -> Result<()> {
        let state = self.current();
        if state >= TransportState::Connected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                op: "send_abort",
                state: state.as_str(),
            })
        }
    }

    /// Inbound synthesis start. Accepted from WaitingForResponse or, for
    /// services that skip the recognition echo, straight from Connected.
    /// Returns false (state untouched) anywhere else.
    pub fn tts_start(&self) -> bool {
        self.transition(TransportState::WaitingForResponse, TransportState::Speaking)
            || self.transition(TransportState::Connected, TransportState::Speaking)
    }

    /// Inbound synthesis stop. Returns the session to Connected; ignored
    /// when no response was in flight.
    pub fn tts_stop(&self) -> bool {
        self.transition(TransportState::Speaking, TransportState::Connected)
            || self.transition(TransportState::WaitingForResponse, TransportState::Connected)
    }

    /// Watchdog path: a response that never arrived. WaitingForResponse ->
    /// Connected so the next turn can start without tearing the link down.
    pub fn recover_to_connected(&self) -> bool {
        self.transition(TransportState::WaitingForResponse, TransportState::Connected)
    }

    /// Hard reset on disconnect or error.
    pub fn reset(&self) {
        self.state
            .store(TransportState::Idle as u8, Ordering::Release);
    }

    fn transition(&self, from: TransportState, to: TransportState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn guarded(&self, op: &'static str, from: TransportState, to: TransportState) -> Result<()> {
        if self.transition(from, to) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                op,
                state: self.current().as_str(),
            })
        }
    }
}

/// Events surfaced by the transport I/O task to the dialog engine.
/// Connection establishment is synchronous (`ws::WsClient::connect`), so
/// only mid-session traffic flows here.
#[derive(Debug)]
pub enum TransportEvent {
    Disconnected,
    /// Recognition text for the uploaded utterance.
    Stt { text: String },
    TtsStart,
    TtsStop,
    /// Raw 16-bit PCM for the reply; only emitted while Speaking.
    TtsAudio(Vec<u8>),
}

/// The configured dialog backend. The two variants run the same turn
/// state machine; batch mode just performs the whole exchange inside one
/// request instead of holding a live session.
pub enum DialogService {
    Streaming(ws::WsClient),
    Batch(http::HttpChat),
}

impl DialogService {
    /// Whether a new utterance may start a turn right now. Batch mode has
    /// no per-connection gate; streaming requires an idle, connected
    /// session.
    pub fn accepts_new_turn(&self) -> bool {
        match self {
            Self::Streaming(client) => client.state() == TransportState::Connected,
            Self::Batch(_) => true,
        }
    }
}
