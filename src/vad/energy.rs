//! Energy measure over audio frames.
//!
//! Mean absolute amplitude is a cheap proxy for signal energy that works
//! well enough for speech/silence discrimination on top of a classifier's
//! voice-activity flag.

/// Mean absolute amplitude of a 16-bit frame.
///
/// `i16::MIN` has no positive counterpart; it is clamped to `i16::MAX`
/// rather than overflowing.
pub fn mean_abs(chunk: &[i16]) -> u16 {
    if chunk.is_empty() {
        return 0;
    }
    let sum: u64 = chunk
        .iter()
        .map(|&s| {
            if s == i16::MIN {
                i16::MAX as u64
            } else {
                s.unsigned_abs() as u64
            }
        })
        .sum();
    (sum / chunk.len() as u64) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_frame_is_silent() {
        assert_eq!(mean_abs(&[]), 0);
    }

    #[test]
    fn mean_abs_averages_magnitudes() {
        assert_eq!(mean_abs(&[100, -100, 100, -100]), 100);
        assert_eq!(mean_abs(&[0, 0, 0, 400]), 100);
    }

    #[test]
    fn int16_min_does_not_overflow() {
        assert_eq!(mean_abs(&[i16::MIN]), i16::MAX as u16);
    }
}
