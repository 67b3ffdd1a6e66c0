//! Embedded feedback sounds, 16 kHz mono PCM WAV.

/// Two-note ascending chime acknowledging a wake event.
pub static WAKE_CHIME: &[u8] = include_bytes!("../assets/wake_chime.wav");

/// Short arpeggio played during the tail-swing celebration.
pub static CELEBRATION: &[u8] = include_bytes!("../assets/celebration.wav");
