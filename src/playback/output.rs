//! Output device abstraction for the playback thread.
//!
//! The real backend queues chunks on a rodio sink. The null backend
//! consumes them against the wall clock, so headless environments and
//! tests keep the same timing behavior without touching a device.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink};

use crate::error::{Error, Result};

/// Samples handed to the device per drain iteration.
pub(super) const CHUNK_SAMPLES: usize = 512;

/// Chunks allowed to sit in the device queue. Keeping this small leaves
/// backpressure in the stream ring where writers can observe it.
pub(super) const MAX_QUEUED_CHUNKS: usize = 8;

pub(super) enum OutputBackend {
    Rodio(RodioOutput),
    Null(NullOutput),
}

impl OutputBackend {
    pub(super) fn rodio() -> Result<Self> {
        Ok(Self::Rodio(RodioOutput::open()?))
    }

    pub(super) fn null() -> Self {
        Self::Null(NullOutput::new())
    }

    /// Queue a mono chunk for output.
    pub(super) fn write(&mut self, pcm: &[i16], sample_rate: u32) {
        match self {
            Self::Rodio(out) => out
                .sink
                .append(SamplesBuffer::new(1, sample_rate, pcm.to_vec())),
            Self::Null(out) => out.write(pcm, sample_rate),
        }
    }

    /// Chunks queued and not yet played out, the current one included.
    pub(super) fn queued_chunks(&mut self) -> usize {
        match self {
            Self::Rodio(out) => out.sink.len(),
            Self::Null(out) => out.queued(),
        }
    }

    /// True once every queued chunk has played out.
    pub(super) fn is_done(&mut self) -> bool {
        self.queued_chunks() == 0
    }

    /// Drop everything queued.
    pub(super) fn stop(&mut self) {
        match self {
            Self::Rodio(out) => {
                out.sink.stop();
                // a stopped sink keeps its pause flag; clear it so the
                // next source starts audible
                out.sink.play();
            }
            Self::Null(out) => out.stop(),
        }
    }

    pub(super) fn pause(&mut self) {
        match self {
            Self::Rodio(out) => out.sink.pause(),
            Self::Null(out) => out.pause(),
        }
    }

    pub(super) fn resume(&mut self) {
        match self {
            Self::Rodio(out) => out.sink.play(),
            Self::Null(out) => out.resume(),
        }
    }
}

/// Default output device behind a rodio sink.
pub(super) struct RodioOutput {
    _stream: OutputStream,
    sink: Sink,
}

impl RodioOutput {
    fn open() -> Result<Self> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| Error::AudioDevice(format!("opening audio output: {e}")))?;
        let sink = Sink::try_new(&handle)
            .map_err(|e| Error::AudioDevice(format!("creating output sink: {e}")))?;
        Ok(Self {
            _stream: stream,
            sink,
        })
    }
}

/// Consumes audio in real time without a device.
pub(super) struct NullOutput {
    /// Wall-clock instants at which each queued chunk finishes.
    ends: VecDeque<Instant>,
    paused_at: Option<Instant>,
}

impl NullOutput {
    fn new() -> Self {
        Self {
            ends: VecDeque::new(),
            paused_at: None,
        }
    }

    fn now(&self) -> Instant {
        self.paused_at.unwrap_or_else(Instant::now)
    }

    fn write(&mut self, pcm: &[i16], sample_rate: u32) {
        let rate = sample_rate.max(1) as u64;
        let dur = Duration::from_micros(pcm.len() as u64 * 1_000_000 / rate);
        let now = self.now();
        let start = self.ends.back().copied().unwrap_or(now).max(now);
        self.ends.push_back(start + dur);
    }

    fn queued(&mut self) -> usize {
        let now = self.now();
        while self.ends.front().map_or(false, |end| *end <= now) {
            self.ends.pop_front();
        }
        self.ends.len()
    }

    fn stop(&mut self) {
        self.ends.clear();
        self.paused_at = None;
    }

    fn pause(&mut self) {
        if self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    fn resume(&mut self) {
        if let Some(paused_at) = self.paused_at.take() {
            let held = paused_at.elapsed();
            for end in &mut self.ends {
                *end += held;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn null_backend_consumes_in_real_time() {
        let mut out = OutputBackend::null();
        out.write(&[0i16; 160], 16_000); // 10 ms
        assert_eq!(out.queued_chunks(), 1);
        thread::sleep(Duration::from_millis(30));
        assert!(out.is_done());
    }

    #[test]
    fn pause_freezes_the_null_clock() {
        let mut out = OutputBackend::null();
        out.write(&[0i16; 320], 16_000); // 20 ms
        out.pause();
        thread::sleep(Duration::from_millis(40));
        assert_eq!(out.queued_chunks(), 1);
        out.resume();
        thread::sleep(Duration::from_millis(40));
        assert!(out.is_done());
    }

    #[test]
    fn stop_clears_the_queue() {
        let mut out = OutputBackend::null();
        out.write(&[0i16; 16_000], 16_000);
        out.stop();
        assert!(out.is_done());
    }
}
