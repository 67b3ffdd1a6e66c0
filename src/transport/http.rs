//! HTTP/WAV dialog fallback.
//!
//! One POST carries the whole utterance as a WAV body; the reply is
//! either a complete WAV file (buffered, validated, handed back to the
//! caller) or a raw 16-bit PCM stream fed straight into the playback
//! manager for lower first-audio latency.

use std::time::Duration;

use tracing::{info, warn};

use crate::audio::wav;
use crate::config::{HttpConfig, PlaybackConfig};
use crate::playback::Player;
use crate::{Error, Result};

/// Bound on re-pairing a sample split across chunk boundaries.
const PAIR_WRITE_TIMEOUT: Duration = Duration::from_millis(1_000);

#[derive(Clone)]
pub struct HttpChat {
    client: reqwest::Client,
    url: String,
    device_id: String,
    max_response_bytes: usize,
    prebuffer_ms: u32,
    stream_write_timeout: Duration,
}

impl HttpChat {
    pub fn new(
        url: &str,
        device_id: &str,
        http: &HttpConfig,
        playback: &PlaybackConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(http.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            device_id: device_id.to_string(),
            max_response_bytes: http.max_response_bytes,
            prebuffer_ms: playback.prebuffer_ms,
            stream_write_timeout: Duration::from_millis(playback.stream_write_timeout_ms),
        })
    }

    /// Upload an utterance and return the complete WAV reply.
    ///
    /// The body is accumulated under a hard cap and checked for the RIFF
    /// magic before it is allowed anywhere near the playback manager.
    pub async fn chat_wav(&self, wav_body: Vec<u8>) -> Result<Vec<u8>> {
        info!(bytes = wav_body.len(), url = %self.url, "Dialog request");
        let mut resp = self.request(wav_body, "audio/wav").await?;

        if let Some(len) = resp.content_length() {
            if len as usize > self.max_response_bytes {
                return Err(Error::ResponseTooLarge {
                    got: len as usize,
                    cap: self.max_response_bytes,
                });
            }
        }

        let mut body = Vec::with_capacity(16 * 1024);
        while let Some(chunk) = resp.chunk().await? {
            if body.len() + chunk.len() > self.max_response_bytes {
                return Err(Error::ResponseTooLarge {
                    got: body.len() + chunk.len(),
                    cap: self.max_response_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        if body.is_empty() {
            return Err(Error::Transport("empty audio response".to_string()));
        }
        if !wav::is_riff(&body) {
            let prefix: String = body.iter().take(16).map(|b| format!("{b:02x}")).collect();
            warn!(prefix = %prefix, "Reply is not RIFF/WAVE");
            return Err(Error::AudioFormat("reply is not RIFF/WAVE".to_string()));
        }

        info!(bytes = body.len(), "Assistant audio received");
        Ok(body)
    }

    /// Upload an utterance and play the raw PCM reply as it streams in.
    ///
    /// The reply sample rate comes from the `X-Audio-Sample-Rate` header
    /// when present and plausible; 16 kHz otherwise. A sample split
    /// across chunk boundaries is carried and re-paired.
    pub async fn chat_pcm_stream(&self, wav_body: Vec<u8>, player: &Player) -> Result<()> {
        info!(bytes = wav_body.len(), url = %self.url, "Dialog request (pcm stream)");
        let mut resp = self.request(wav_body, "audio/L16").await?;

        let sample_rate = resp
            .headers()
            .get("X-Audio-Sample-Rate")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u32>().ok())
            .filter(|r| (8_000..=48_000).contains(r))
            .unwrap_or(16_000);

        player.pcm_stream_begin(sample_rate, self.prebuffer_ms).await?;

        let mut carry: Option<u8> = None;
        let mut result = Ok(());
        loop {
            let chunk = match resp.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    warn!("Reply stream read failed: {}", e);
                    result = Err(e.into());
                    break;
                }
            };

            let mut bytes: &[u8] = &chunk;
            if let Some(first) = carry.take() {
                match bytes.split_first() {
                    Some((&second, rest)) => {
                        let sample = i16::from_le_bytes([first, second]);
                        let _ = player.pcm_stream_write(&[sample], PAIR_WRITE_TIMEOUT).await;
                        bytes = rest;
                    }
                    None => {
                        carry = Some(first);
                        continue;
                    }
                }
            }
            if bytes.len() % 2 == 1 {
                carry = Some(bytes[bytes.len() - 1]);
                bytes = &bytes[..bytes.len() - 1];
            }
            if bytes.is_empty() {
                continue;
            }

            let samples = wav::bytes_to_pcm(bytes);
            if let Err(e) = player
                .pcm_stream_write(&samples, self.stream_write_timeout)
                .await
            {
                warn!("Stream write failed: {}", e);
                result = Err(e);
                break;
            }
        }

        player.pcm_stream_end();
        result
    }

    async fn request(&self, wav_body: Vec<u8>, accept: &'static str) -> Result<reqwest::Response> {
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "audio/wav")
            .header("Accept", accept);
        if !self.device_id.is_empty() {
            req = req.header("X-Device-Id", &self.device_id);
        }

        let resp = req.body(wav_body).send().await?;
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            let detail: String = body.chars().take(256).collect();
            warn!(status = status.as_u16(), detail = %detail, "Dialog service error");
            return Err(Error::ServiceStatus {
                status: status.as_u16(),
                detail,
            });
        }
        Ok(resp)
    }
}
