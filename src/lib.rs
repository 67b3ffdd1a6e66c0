//! Voice interaction core for a small robotic assistant.
//!
//! Captured microphone frames flow through a wake/dialog state machine
//! and an utterance segmenter; finalized utterances reach a cloud dialog
//! service over WebSocket (streaming) or HTTP (batch), and replies play
//! back through a buffered output pipeline. Local motion commands run on
//! a dispatcher whose epoch token cancels superseded actions. A host
//! process supervises everything over stdin/stdout JSON lines.

pub mod actions;
pub mod assets;
pub mod audio;
pub mod config;
pub mod dialog;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod transport;
pub mod vad;

pub use error::{Error, Result};
