//! Minimal RIFF/WAVE compose and parse for 16-bit PCM.
//!
//! The upload path wraps an utterance in a 44-byte header; the reply path
//! and the embedded feedback assets are parsed back to raw samples. Only
//! uncompressed 16-bit PCM is supported; stereo input is down-mixed.

use crate::error::{Error, Result};

/// Total size of the canonical 44-byte header.
pub const WAV_HEADER_LEN: usize = 44;

/// Encode mono 16-bit samples as a complete WAV file.
pub fn encode_wav(pcm: &[i16], sample_rate: u32) -> Vec<u8> {
    let num_samples = pcm.len() as u32;
    let bytes_per_sample: u16 = 2; // 16-bit
    let num_channels: u16 = 1;
    let data_size = num_samples * bytes_per_sample as u32;
    let file_size = 36 + data_size; // RIFF header is 44 bytes total, minus 8 for RIFF+size

    let mut buf = Vec::with_capacity(WAV_HEADER_LEN + data_size as usize);

    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&file_size.to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    // fmt sub-chunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes()); // sub-chunk size
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    buf.extend_from_slice(&num_channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    let byte_rate = sample_rate * num_channels as u32 * bytes_per_sample as u32;
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    let block_align = num_channels * bytes_per_sample;
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&(bytes_per_sample * 8).to_le_bytes()); // bits per sample

    // data sub-chunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    for &sample in pcm {
        buf.extend_from_slice(&sample.to_le_bytes());
    }

    buf
}

/// Quick magic check used before committing to a full parse.
pub fn is_riff(bytes: &[u8]) -> bool {
    bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE"
}

/// Decode a WAV file to (sample rate, mono 16-bit samples).
///
/// Walks the chunk list rather than assuming a fixed layout, since some
/// encoders insert LIST/fact chunks between fmt and data. Stereo is
/// averaged down to mono.
pub fn decode_wav(bytes: &[u8]) -> Result<(u32, Vec<i16>)> {
    if !is_riff(bytes) {
        return Err(Error::AudioFormat("missing RIFF/WAVE magic".into()));
    }

    let mut pos = 12;
    let mut fmt: Option<(u16, u16, u32, u16)> = None; // format, channels, rate, bits
    let mut data: Option<&[u8]> = None;

    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = u32::from_le_bytes([
            bytes[pos + 4],
            bytes[pos + 5],
            bytes[pos + 6],
            bytes[pos + 7],
        ]) as usize;
        let body_start = pos + 8;
        let body_end = body_start.saturating_add(size).min(bytes.len());
        let body = &bytes[body_start..body_end];

        match id {
            b"fmt " => {
                if body.len() < 16 {
                    return Err(Error::AudioFormat("fmt chunk too short".into()));
                }
                let format = u16::from_le_bytes([body[0], body[1]]);
                let channels = u16::from_le_bytes([body[2], body[3]]);
                let rate = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
                let bits = u16::from_le_bytes([body[14], body[15]]);
                fmt = Some((format, channels, rate, bits));
            }
            b"data" => {
                data = Some(body);
            }
            _ => {}
        }

        // Chunks are word-aligned; odd sizes carry a pad byte.
        pos = body_start + size + (size & 1);
    }

    let (format, channels, rate, bits) =
        fmt.ok_or_else(|| Error::AudioFormat("no fmt chunk".into()))?;
    let data = data.ok_or_else(|| Error::AudioFormat("no data chunk".into()))?;

    if format != 1 || bits != 16 {
        return Err(Error::AudioFormat(format!(
            "unsupported encoding: format={} bits={}",
            format, bits
        )));
    }
    if channels == 0 || channels > 2 {
        return Err(Error::AudioFormat(format!("{} channels", channels)));
    }

    let mut samples: Vec<i16> = data
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    if channels == 2 {
        samples = samples
            .chunks_exact(2)
            .map(|lr| ((lr[0] as i32 + lr[1] as i32) / 2) as i16)
            .collect();
    }

    Ok((rate, samples))
}

/// Raw little-endian bytes for a slice of samples (binary wire frames).
pub fn pcm_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        buf.extend_from_slice(&sample.to_le_bytes());
    }
    buf
}

/// Little-endian bytes back to samples. A trailing odd byte is ignored;
/// callers that stream chunks carry it into the next call themselves.
pub fn bytes_to_pcm(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_for_one_second_at_16k() {
        let pcm = vec![0i16; 16_000];
        let wav = encode_wav(&pcm, 16_000);

        assert_eq!(wav.len(), WAV_HEADER_LEN + 32_000);
        // riffSize
        assert_eq!(u32::from_le_bytes([wav[4], wav[5], wav[6], wav[7]]), 32_036);
        // byteRate
        assert_eq!(
            u32::from_le_bytes([wav[28], wav[29], wav[30], wav[31]]),
            32_000
        );
        // dataSize
        assert_eq!(
            u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]),
            32_000
        );
    }

    #[test]
    fn round_trip_preserves_samples() {
        let pcm: Vec<i16> = (0..500).map(|i| (i * 7 % 1000) as i16 - 500).collect();
        let wav = encode_wav(&pcm, 16_000);
        let (rate, decoded) = decode_wav(&wav).unwrap();
        assert_eq!(rate, 16_000);
        assert_eq!(decoded, pcm);
    }

    #[test]
    fn rejects_non_riff_payload() {
        assert!(!is_riff(b"<html>not audio</html>"));
        assert!(decode_wav(b"<html>not audio</html>").is_err());
    }

    #[test]
    fn stereo_is_downmixed() {
        // Hand-build a stereo file: two frames of (100, 300) -> mono 200.
        let mut wav = encode_wav(&[], 16_000);
        // Rewrite channel count to 2 and splice in interleaved data.
        wav[22] = 2;
        let data: Vec<u8> = [100i16, 300, 100, 300]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let len = data.len() as u32;
        wav.extend_from_slice(&data);
        let riff_size = (wav.len() - 8) as u32;
        wav[4..8].copy_from_slice(&riff_size.to_le_bytes());
        wav[40..44].copy_from_slice(&len.to_le_bytes());

        let (_, decoded) = decode_wav(&wav).unwrap();
        assert_eq!(decoded, vec![200, 200]);
    }

    #[test]
    fn byte_conversions_mirror_each_other() {
        let pcm = vec![-1i16, 0, 257, i16::MIN, i16::MAX];
        let bytes = pcm_to_bytes(&pcm);
        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes_to_pcm(&bytes), pcm);
        // Odd trailing byte is dropped.
        assert_eq!(bytes_to_pcm(&bytes[..9]), pcm[..4]);
    }
}
