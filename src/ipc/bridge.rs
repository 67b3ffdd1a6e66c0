//! Host link plumbing: stdout event emitter, stdin command reader, and
//! the host-backed actuator and detector-gate implementations.

use std::io::{self, BufRead, Write};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{HostCommand, HostEvent};
use crate::actions::Actuators;
use crate::dialog::WakeDetector;

/// The line actually written to stdout: the tagged event plus a UTC
/// timestamp.
#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(flatten)]
    event: &'a HostEvent,
    ts: String,
}

/// Emit a `HostEvent` as a JSON line on stdout and flush.
pub fn emit_event(event: &HostEvent) {
    let envelope = Envelope {
        event,
        ts: Utc::now().to_rfc3339(),
    };
    let json = match serde_json::to_string(&envelope) {
        Ok(j) => j,
        Err(e) => {
            error!("Failed to serialize event: {}", e);
            return;
        }
    };
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    // pipe may be closed; nothing useful to do about it
    let _ = writeln!(handle, "{}", json);
    let _ = handle.flush();
}

/// Convenience helper for emitting error events.
pub fn emit_error(message: &str) {
    emit_event(&HostEvent::Error {
        message: message.to_string(),
    });
}

/// Spawn a blocking thread that reads JSON lines from stdin, deserializes
/// them into `HostCommand`, and forwards them through the returned channel.
///
/// The thread exits when stdin is closed (supervisor gone) or on
/// unrecoverable read error.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<HostCommand> {
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        let reader = stdin.lock();
        for line in reader.lines() {
            match line {
                Ok(text) => {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<HostCommand>(trimmed) {
                        Ok(cmd) => {
                            debug!(?cmd, "Received host command");
                            if tx.send(cmd).is_err() {
                                break; // receiver dropped, main task is gone
                            }
                        }
                        Err(e) => {
                            error!("Invalid host command: {} -- input: {}", e, trimmed);
                            emit_error(&format!("invalid command: {}", e));
                        }
                    }
                }
                Err(e) => {
                    error!("stdin read error: {}", e);
                    break;
                }
            }
        }
        debug!("stdin reader thread exiting");
    });

    rx
}

/// Actuators surfaced to the supervisor as host events; the hardware (or
/// a visualization) lives on the other side of the pipe.
pub struct HostActuators {
    events: mpsc::UnboundedSender<HostEvent>,
}

impl HostActuators {
    pub fn new(events: mpsc::UnboundedSender<HostEvent>) -> Self {
        Self { events }
    }
}

impl Actuators for HostActuators {
    fn set_light(&mut self, on: bool) {
        let _ = self.events.send(HostEvent::ActuatorLight { on });
    }

    fn set_tail_angle(&mut self, degrees: f32) {
        let _ = self.events.send(HostEvent::ActuatorTail { degrees });
    }
}

/// Detector gate surfaced to the supervisor, which stands in for the
/// on-device wake classifier.
pub struct HostDetector {
    events: mpsc::UnboundedSender<HostEvent>,
}

impl HostDetector {
    pub fn new(events: mpsc::UnboundedSender<HostEvent>) -> Self {
        Self { events }
    }
}

impl WakeDetector for HostDetector {
    fn set_enabled(&mut self, enabled: bool) {
        let _ = self.events.send(HostEvent::DetectorState { enabled });
    }

    fn flush(&mut self) {
        debug!("Detector state flushed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_event_and_timestamp() {
        let event = HostEvent::Wake {};
        let envelope = Envelope {
            event: &event,
            ts: "2026-01-01T00:00:00+00:00".to_string(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert_eq!(
            json,
            r#"{"event":"wake","data":{},"ts":"2026-01-01T00:00:00+00:00"}"#
        );
    }

    #[tokio::test]
    async fn host_actuators_emit_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut actuators = HostActuators::new(tx);
        actuators.set_light(true);
        actuators.set_tail_angle(135.0);

        assert!(matches!(
            rx.recv().await,
            Some(HostEvent::ActuatorLight { on: true })
        ));
        match rx.recv().await {
            Some(HostEvent::ActuatorTail { degrees }) => assert_eq!(degrees, 135.0),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
