//! Configuration reading and data directory paths.
//!
//! Config lives in `robot_voice.json` inside the data directory. Every
//! field has a default so a missing or partial file still yields a working
//! setup. Service URLs can be overridden through the environment
//! (`ROBOT_VOICE_WS_URL`, `ROBOT_VOICE_CHAT_URL`, `ROBOT_VOICE_DEVICE_ID`).

pub mod paths;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use paths::get_data_dir;

/// Top-level robot_voice.json shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Stable device identifier sent in transport handshakes.
    pub device_id: Option<String>,
    /// WebSocket dialog service URL; when set, the streaming pipeline is used.
    pub ws_url: Option<String>,
    /// HTTP/WAV dialog service URL; used when no WebSocket URL is configured.
    pub chat_url: Option<String>,
    /// Capture/upload sample rate in Hz.
    pub sample_rate_hz: u32,
    /// Samples per audio frame delivered by the front-end.
    pub frame_samples: usize,
    pub dialog: DialogConfig,
    pub segmenter: SegmenterConfig,
    pub playback: PlaybackConfig,
    pub http: HttpConfig,
    pub connect: ConnectConfig,
    pub actions: ActionConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            ws_url: None,
            chat_url: None,
            sample_rate_hz: 16_000,
            frame_samples: 512,
            dialog: DialogConfig::default(),
            segmenter: SegmenterConfig::default(),
            playback: PlaybackConfig::default(),
            http: HttpConfig::default(),
            connect: ConnectConfig::default(),
            actions: ActionConfig::default(),
        }
    }
}

/// Wake/dialog session tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogConfig {
    /// Continuous-dialog mode; when false a wake event only opens a
    /// local-command window.
    pub enabled: bool,
    /// Inactivity span after which a dialog session ends.
    pub session_timeout_ms: u64,
    /// Fixed local-command listening window after wake.
    pub command_timeout_ms: u64,
    /// Segmenter suppression window after a local command fires.
    pub command_ignore_ms: u64,
    /// Watchdog for a turn stuck awaiting the service's response.
    pub stt_timeout_ms: u64,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            session_timeout_ms: 20_000,
            command_timeout_ms: 6_000,
            command_ignore_ms: 1_200,
            stt_timeout_ms: 10_000,
        }
    }
}

/// Utterance endpointing tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Shortest speech span that may finalize an utterance.
    pub min_speech_ms: u32,
    /// Trailing silence required for a natural finalize.
    pub end_silence_ms: u32,
    /// Hard cap on speech+silence per utterance.
    pub max_utterance_ms: u32,
    /// Hard cap on buffered audio per utterance.
    pub max_pcm_ms: u32,
    /// Mean-absolute-amplitude gate on top of the VAD flag; 0 disables.
    pub energy_gate_mean_abs: u16,
    /// Pre-speech audio retained so onset is not clipped.
    pub pre_roll_ms: u32,
    /// Trailing silence kept after a natural finalize trim.
    pub keep_tail_ms: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_speech_ms: 300,
            end_silence_ms: 450,
            max_utterance_ms: 8_000,
            max_pcm_ms: 10_000,
            energy_gate_mean_abs: 0,
            pre_roll_ms: 200,
            keep_tail_ms: 200,
        }
    }
}

/// Playback manager tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Audio buffered in the stream ring before consumption starts.
    pub prebuffer_ms: u32,
    /// Bound on a blocking stream write when the ring is full.
    pub stream_write_timeout_ms: u64,
    /// Bound on waiting for the player to reach idle during a source switch.
    pub wait_idle_timeout_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            prebuffer_ms: 80,
            stream_write_timeout_ms: 2_000,
            wait_idle_timeout_ms: 3_000,
        }
    }
}

/// HTTP/WAV fallback tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Overall request timeout.
    pub timeout_ms: u64,
    /// Hard cap on a buffered WAV reply.
    pub max_response_bytes: usize,
    /// Ask for a raw PCM reply stream instead of a buffered WAV file.
    pub use_pcm_stream: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            max_response_bytes: 1024 * 1024,
            use_pcm_stream: false,
        }
    }
}

/// WebSocket connect/retry tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Bound on one connect + handshake attempt.
    pub connect_timeout_ms: u64,
    /// First retry delay; doubles per attempt.
    pub backoff_initial_ms: u64,
    /// Retry delay ceiling.
    pub backoff_max_ms: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
        }
    }
}

/// Local command action tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionConfig {
    /// Tail servo resting position in degrees.
    pub servo_center_angle: f32,
    /// Swing amplitude either side of center, in degrees.
    pub servo_rotate_angle: f32,
    /// Light flashes during the celebration move.
    pub led_flash_count: u32,
    /// Tail swings during the celebration move.
    pub servo_swing_count: u32,
    /// Delay between light toggles.
    pub flash_delay_ms: u64,
    /// Delay between tail positions.
    pub swing_delay_ms: u64,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            servo_center_angle: 90.0,
            servo_rotate_angle: 90.0,
            led_flash_count: 5,
            servo_swing_count: 3,
            flash_delay_ms: 200,
            swing_delay_ms: 300,
        }
    }
}

impl CoreConfig {
    /// Milliseconds of audio per frame at the configured rate.
    pub fn frame_ms(&self) -> u32 {
        (self.frame_samples as u32 * 1_000) / self.sample_rate_hz
    }

    /// True when the streaming WebSocket pipeline is configured.
    pub fn use_websocket(&self) -> bool {
        self.ws_url.is_some()
    }

    /// True when any dialog service is configured at all.
    pub fn has_dialog_service(&self) -> bool {
        self.ws_url.is_some() || self.chat_url.is_some()
    }
}

/// Read robot_voice.json from the data directory and apply env overrides.
pub fn read_config() -> CoreConfig {
    let mut cfg: CoreConfig = read_json_file(&get_config_path()).unwrap_or_default();
    if let Ok(url) = std::env::var("ROBOT_VOICE_WS_URL") {
        if !url.is_empty() {
            cfg.ws_url = Some(url);
        }
    }
    if let Ok(url) = std::env::var("ROBOT_VOICE_CHAT_URL") {
        if !url.is_empty() {
            cfg.chat_url = Some(url);
        }
    }
    if let Ok(id) = std::env::var("ROBOT_VOICE_DEVICE_ID") {
        if !id.is_empty() {
            cfg.device_id = Some(id);
        }
    }
    cfg
}

/// Path to robot_voice.json.
pub fn get_config_path() -> PathBuf {
    get_data_dir().join("robot_voice.json")
}

/// Generic helper: read a JSON file and deserialize it.
fn read_json_file<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Option<T> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(val) => Some(val),
            Err(e) => {
                warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_yield_working_config() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.sample_rate_hz, 16_000);
        assert_eq!(cfg.segmenter.min_speech_ms, 300);
        assert_eq!(cfg.segmenter.end_silence_ms, 450);
        assert_eq!(cfg.segmenter.max_utterance_ms, 8_000);
        assert_eq!(cfg.dialog.session_timeout_ms, 20_000);
        assert_eq!(cfg.dialog.command_timeout_ms, 6_000);
        assert!(cfg.dialog.enabled);
    }

    #[test]
    fn partial_json_keeps_defaults_elsewhere() {
        let cfg: CoreConfig =
            serde_json::from_str(r#"{"segmenter": {"min_speech_ms": 500}}"#).unwrap();
        assert_eq!(cfg.segmenter.min_speech_ms, 500);
        assert_eq!(cfg.segmenter.end_silence_ms, 450);
        assert_eq!(cfg.dialog.session_timeout_ms, 20_000);
    }

    #[test]
    fn frame_ms_derives_from_rate() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.frame_ms(), 32);
    }
}
