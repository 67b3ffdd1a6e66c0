//! Microphone front-end via cpal.
//!
//! Opens the default (or named) input device, captures audio at its native
//! sample rate, down-mixes and resamples to the pipeline rate, quantizes to
//! 16-bit, and writes into a lock-free ring. A pump task assembles
//! fixed-size annotated frames from the ring and feeds the detection loop,
//! dropping frames rather than ever blocking the audio path.

use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::ring_buffer::{AudioConsumer, AudioProducer};
use super::AudioFrame;
use crate::error::{Error, Result};
use crate::vad::energy;

/// Mean-absolute-amplitude threshold for the front-end's stand-in
/// voice-activity flag (on 16-bit samples).
pub const DEFAULT_ACTIVITY_MEAN_ABS: u16 = 900;

/// Resolved info about the audio input we will use.
struct CaptureConfig {
    device: cpal::Device,
    stream_config: StreamConfig,
    native_rate: u32,
}

/// Find and configure the input device.
fn resolve_device(device_name: Option<&str>, target_rate: u32) -> Result<CaptureConfig> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| Error::AudioDevice(format!("enumerating input devices: {e}")))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| Error::AudioDevice(format!("input device not found: {name}")))?
    } else {
        host.default_input_device()
            .ok_or_else(|| Error::AudioDevice("no default input device".into()))?
    };

    let dev_name = device.name().unwrap_or_else(|_| "unknown".into());
    info!(device = %dev_name, "Selected input device");

    let default_config = device
        .default_input_config()
        .map_err(|e| Error::AudioDevice(format!("default input config: {e}")))?;

    let native_rate = default_config.sample_rate().0;
    let channels = default_config.channels();

    let stream_config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(native_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    info!(
        native_rate,
        channels, "Input device config (will resample to {}Hz mono if needed)", target_rate,
    );

    Ok(CaptureConfig {
        device,
        stream_config,
        native_rate,
    })
}

/// Simple linear resampler from `from_rate` to `to_rate`.
/// Operates on mono f32 samples.
fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_idx = i as f64 * ratio;
        let idx0 = src_idx.floor() as usize;
        let frac = (src_idx - idx0 as f64) as f32;
        let s0 = input.get(idx0).copied().unwrap_or(0.0);
        let s1 = input.get(idx0 + 1).copied().unwrap_or(s0);
        output.push(s0 + frac * (s1 - s0));
    }
    output
}

/// Down-mix multi-channel audio to mono by averaging channels.
fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Quantize float samples to 16-bit PCM.
fn to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * 32_767.0) as i16)
        .collect()
}

/// Start audio capture. Returns the cpal `Stream` (must be kept alive).
///
/// Audio is converted to 16-bit mono at `target_rate` and pushed into the
/// ring buffer producer. `device_name` of `None` uses the system default.
pub fn start_capture(
    mut producer: AudioProducer,
    device_name: Option<&str>,
    target_rate: u32,
) -> Result<Stream> {
    let cfg = resolve_device(device_name, target_rate)?;
    let native_rate = cfg.native_rate;
    let channels = cfg.stream_config.channels;
    let needs_resample = native_rate != target_rate;
    let needs_downmix = channels > 1;

    let stream = cfg
        .device
        .build_input_stream(
            &cfg.stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = if needs_downmix {
                    to_mono(data, channels)
                } else {
                    data.to_vec()
                };

                let resampled = if needs_resample {
                    resample_linear(&mono, native_rate, target_rate)
                } else {
                    mono
                };

                let pcm = to_i16(&resampled);
                // On overrun the tail of this callback's audio is dropped.
                let _ = producer.push_slice(&pcm);
            },
            move |err| {
                error!("Audio input stream error: {}", err);
            },
            None, // no timeout
        )
        .map_err(|e| Error::AudioDevice(format!("building input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| Error::AudioDevice(format!("starting input stream: {e}")))?;

    info!("Audio capture started");

    Ok(stream)
}

/// Assemble fixed-size frames from the capture ring and feed the detection
/// loop. Frames carry an energy-derived activity flag; when the channel is
/// full they are dropped, never queued.
pub fn spawn_frame_pump(
    mut consumer: AudioConsumer,
    frame_samples: usize,
    activity_mean_abs: u16,
    tx: mpsc::Sender<AudioFrame>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(10));
        let mut frame = vec![0i16; frame_samples];
        loop {
            tick.tick().await;
            if tx.is_closed() {
                debug!("Frame pump exiting: engine channel closed");
                return;
            }
            while consumer.available() >= frame_samples {
                let n = consumer.pop_slice(&mut frame);
                let pcm = frame[..n].to_vec();
                let vad_speech = energy::mean_abs(&pcm) >= activity_mean_abs;
                let _ = tx.try_send(AudioFrame { pcm, vad_speech });
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_averages_channel_pairs() {
        let stereo = [0.2f32, 0.4, -0.1, -0.3];
        let mono = to_mono(&stereo, 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!((mono[1] + 0.2).abs() < 1e-6);
    }

    #[test]
    fn resample_halves_sample_count() {
        let input: Vec<f32> = (0..100).map(|i| i as f32 / 100.0).collect();
        let out = resample_linear(&input, 32_000, 16_000);
        assert_eq!(out.len(), 50);
    }

    #[test]
    fn quantization_clamps_out_of_range() {
        let out = to_i16(&[2.0, -2.0, 0.0]);
        assert_eq!(out, vec![32_767, -32_767, 0]);
    }
}
