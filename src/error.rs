//! Error types for the voice core.

use thiserror::Error;

/// Result type alias for voice core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice core.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation issued in a state that does not permit it.
    #[error("{op} not valid in state {state}")]
    InvalidState {
        op: &'static str,
        state: &'static str,
    },

    /// A bounded wait ran out of time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A bounded queue refused a zero-timeout send.
    #[error("{0} queue full")]
    QueueFull(&'static str),

    /// Transport-level failure (socket, handshake, protocol).
    #[error("transport error: {0}")]
    Transport(String),

    /// Dialog service replied with a non-success status.
    #[error("dialog service returned {status}: {detail}")]
    ServiceStatus { status: u16, detail: String },

    /// Response exceeded the configured size cap.
    #[error("response too large: {got} bytes exceeds cap of {cap}")]
    ResponseTooLarge { got: usize, cap: usize },

    /// Malformed or unexpected audio payload.
    #[error("audio format error: {0}")]
    AudioFormat(String),

    /// Audio device setup or playback failure.
    #[error("audio device error: {0}")]
    AudioDevice(String),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
