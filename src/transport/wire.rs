//! Cloud dialog protocol messages.
//!
//! Control messages travel as JSON text frames discriminated by `type`
//! (Rust -> service: hello, listen, abort; service -> Rust: hello, stt,
//! tts). Audio travels as raw binary PCM frames on the same connection.

use serde::{Deserialize, Serialize};

/// Audio format declaration inside the client hello.
#[derive(Debug, Clone, Serialize)]
pub struct AudioParams {
    pub format: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Control messages sent to the dialog service.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        version: u32,
        transport: String,
        audio_params: AudioParams,
    },
    Listen {
        session_id: String,
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<String>,
    },
    Abort {
        session_id: String,
        reason: String,
    },
}

impl ClientMessage {
    /// Capability handshake, sent once per connection right after open.
    pub fn hello(sample_rate: u32) -> Self {
        Self::Hello {
            version: 1,
            transport: "websocket".to_string(),
            audio_params: AudioParams {
                format: "pcm".to_string(),
                sample_rate,
                channels: 1,
            },
        }
    }

    pub fn listen_start(session_id: &str) -> Self {
        Self::Listen {
            session_id: session_id.to_string(),
            state: "start".to_string(),
            mode: Some("auto".to_string()),
        }
    }

    pub fn listen_stop(session_id: &str) -> Self {
        Self::Listen {
            session_id: session_id.to_string(),
            state: "stop".to_string(),
            mode: None,
        }
    }

    pub fn abort(session_id: &str) -> Self {
        Self::Abort {
            session_id: session_id.to_string(),
            reason: "user_interrupt".to_string(),
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Sample-rate negotiation in the service hello reply.
#[derive(Debug, Clone, Deserialize)]
pub struct NegotiatedAudio {
    #[serde(default)]
    pub sample_rate: Option<u32>,
}

/// Control messages received from the dialog service. Unknown `type`
/// values fail to parse and are logged and ignored by the caller.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        audio_params: Option<NegotiatedAudio>,
    },
    Stt {
        #[serde(default)]
        text: String,
    },
    Tts {
        state: String,
        #[serde(default)]
        text: Option<String>,
    },
}

impl ServerMessage {
    pub fn from_json(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_shape() {
        let json = ClientMessage::hello(16_000).to_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "hello");
        assert_eq!(v["version"], 1);
        assert_eq!(v["transport"], "websocket");
        assert_eq!(v["audio_params"]["format"], "pcm");
        assert_eq!(v["audio_params"]["sample_rate"], 16_000);
        assert_eq!(v["audio_params"]["channels"], 1);
    }

    #[test]
    fn listen_shapes() {
        let start = ClientMessage::listen_start("s-1").to_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(&start).unwrap();
        assert_eq!(v["type"], "listen");
        assert_eq!(v["session_id"], "s-1");
        assert_eq!(v["state"], "start");
        assert_eq!(v["mode"], "auto");

        let stop = ClientMessage::listen_stop("s-1").to_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(&stop).unwrap();
        assert_eq!(v["state"], "stop");
        assert!(v.get("mode").is_none());
    }

    #[test]
    fn abort_carries_reason() {
        let json = ClientMessage::abort("s-1").to_json().unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "abort");
        assert_eq!(v["reason"], "user_interrupt");
    }

    #[test]
    fn parses_service_hello() {
        let msg = ServerMessage::from_json(
            r#"{"type":"hello","session_id":"abc","transport":"websocket","audio_params":{"sample_rate":24000}}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Hello {
                session_id,
                audio_params,
            } => {
                assert_eq!(session_id.as_deref(), Some("abc"));
                assert_eq!(audio_params.unwrap().sample_rate, Some(24_000));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn parses_tts_and_stt() {
        match ServerMessage::from_json(r#"{"type":"tts","state":"start"}"#).unwrap() {
            ServerMessage::Tts { state, .. } => assert_eq!(state, "start"),
            other => panic!("unexpected message: {:?}", other),
        }
        match ServerMessage::from_json(r#"{"type":"stt","text":"turn on the light"}"#).unwrap() {
            ServerMessage::Stt { text } => assert_eq!(text, "turn on the light"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(ServerMessage::from_json(r#"{"type":"mcu","payload":{}}"#).is_err());
    }
}
