//! Audio frame plumbing: capture front-end, sample ring buffer, WAV codec.

pub mod capture;
pub mod ring_buffer;
pub mod wav;

/// One fixed-size front-end frame: mono 16-bit samples plus the
/// classifier's voice-activity flag.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pcm: Vec<i16>,
    pub vad_speech: bool,
}

impl AudioFrame {
    /// Frame duration in milliseconds at the given rate.
    pub fn duration_ms(&self, sample_rate: u32) -> u32 {
        (self.pcm.len() as u32 * 1_000) / sample_rate
    }
}
