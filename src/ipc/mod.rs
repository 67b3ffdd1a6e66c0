//! Host link protocol types.
//!
//! The core talks to its supervisor over the process pipes: events go out
//! on stdout as JSON lines, commands come in on stdin. Events use
//! `{"event": "<name>", "data": {...}, "ts": "..."}`; commands use
//! `{"command": "<name>", ...}`.

pub mod bridge;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Events: core -> supervisor (stdout)
// ---------------------------------------------------------------------------

/// All events emitted to the supervisor.
///
/// Serialized as `{"event": "<variant>", "data": {...}}`; the bridge adds
/// the timestamp envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum HostEvent {
    Starting {},
    Ready {},
    /// Wake event accepted; a session is being set up.
    Wake {},
    /// A dialog session or command window opened. `mode` is `dialog` or
    /// `command`.
    SessionStart { mode: String },
    /// The session or window closed; `reason` is `timeout`,
    /// `exit_requested`, `matched`, `disconnected`, or `shutdown`.
    SessionEnd { reason: String },
    /// Recognition text for the last utterance.
    Stt { text: String },
    /// Assistant speech synthesis `start` / `stop`.
    TtsState { state: String },
    /// Playback manager state change.
    PlayerState { state: String },
    /// A local command finished executing.
    Command { command: String },
    /// Wake detection gate toggled by the session machine.
    DetectorState { enabled: bool },
    /// Discrete actuator: the light.
    ActuatorLight { on: bool },
    /// Continuous actuator: the tail servo position.
    ActuatorTail { degrees: f32 },
    Status {
        state: String,
        session_active: bool,
        turn_busy: bool,
        player: String,
    },
    Error { message: String },
    Stopping {},
}

// ---------------------------------------------------------------------------
// Commands: supervisor -> core (stdin)
// ---------------------------------------------------------------------------

/// All commands accepted from the supervisor.
///
/// Deserialized from `{"command": "<variant>", ...}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command")]
#[serde(rename_all = "snake_case")]
pub enum HostCommand {
    /// Wake trigger, the supervisor's stand-in for the wake phrase.
    Wake {},
    /// Local command, by classifier id or free text.
    Command {
        #[serde(default)]
        id: Option<i32>,
        #[serde(default)]
        text: Option<String>,
    },
    /// Ask the session machine to leave dialog mode.
    ExitDialog {},
    /// Report current state.
    Status {},
    /// Shut the core down.
    Stop {},
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_use_tagged_envelope() {
        let json = serde_json::to_string(&HostEvent::SessionStart {
            mode: "dialog".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"session_start","data":{"mode":"dialog"}}"#);

        let json = serde_json::to_string(&HostEvent::Ready {}).unwrap();
        assert_eq!(json, r#"{"event":"ready","data":{}}"#);
    }

    #[test]
    fn commands_parse_by_tag() {
        let cmd: HostCommand = serde_json::from_str(r#"{"command":"wake"}"#).unwrap();
        assert!(matches!(cmd, HostCommand::Wake {}));

        let cmd: HostCommand =
            serde_json::from_str(r#"{"command":"command","text":"light on"}"#).unwrap();
        match cmd {
            HostCommand::Command { id, text } => {
                assert_eq!(id, None);
                assert_eq!(text.as_deref(), Some("light on"));
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let cmd: HostCommand = serde_json::from_str(r#"{"command":"command","id":4}"#).unwrap();
        assert!(matches!(cmd, HostCommand::Command { id: Some(4), .. }));
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert!(serde_json::from_str::<HostCommand>(r#"{"command":"reboot"}"#).is_err());
    }
}
