//! # PCM to WAV Conversion
//!
//! The engine streams headerless PCM. Players (and the debug recorder) need a
//! RIFF/WAV container around it, which is what this module produces.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};

/// Audio format of a PCM stream.
///
/// ## Defaults:
/// Matches the engine's audio output: 24kHz, mono, 16-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            channels: 1,
            bits_per_sample: 16,
        }
    }
}

impl PcmFormat {
    pub fn mono_16bit(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..Self::default()
        }
    }
}

/// Split little-endian PCM bytes into 16-bit samples.
///
/// A trailing odd byte cannot form a sample and is rejected.
pub fn pcm_samples(data: &[u8]) -> Result<Vec<i16>, String> {
    if data.len() % 2 != 0 {
        return Err("PCM data length must be even for 16-bit samples".to_string());
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }

    Ok(samples)
}

/// Length of the canonical PCM WAV header written by [`wav_header`].
pub const WAV_HEADER_LEN: u64 = 44;

/// RIFF/WAV header for `data_len` bytes of 16-bit PCM.
///
/// The header is written before the samples are known, then rewritten with the
/// final size, so recordings never have to be held in memory.
pub fn wav_header(format: PcmFormat, data_len: u32) -> Result<Vec<u8>, String> {
    if format.bits_per_sample != 16 {
        return Err(format!(
            "Unsupported bit depth {} (only 16-bit PCM is relayed)",
            format.bits_per_sample
        ));
    }

    let fmt: [u8; 16] = wav::Header::new(
        wav::WAV_FORMAT_PCM,
        format.channels,
        format.sample_rate,
        format.bits_per_sample,
    )
    .into();

    let mut out = Vec::with_capacity(WAV_HEADER_LEN as usize);
    let io = |e: std::io::Error| format!("Failed to build WAV header: {}", e);
    out.write_all(b"RIFF").map_err(io)?;
    out.write_u32::<LittleEndian>(data_len.saturating_add(36)).map_err(io)?;
    out.write_all(b"WAVE").map_err(io)?;
    out.write_all(b"fmt ").map_err(io)?;
    out.write_u32::<LittleEndian>(fmt.len() as u32).map_err(io)?;
    out.write_all(&fmt).map_err(io)?;
    out.write_all(b"data").map_err(io)?;
    out.write_u32::<LittleEndian>(data_len).map_err(io)?;

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_samples_little_endian() {
        let samples = pcm_samples(&[0x01, 0x00, 0xff, 0x7f, 0x00, 0x80]).unwrap();
        assert_eq!(samples, vec![1, i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_odd_length_is_rejected() {
        assert!(pcm_samples(&[0x00, 0x01, 0x02]).is_err());
    }

    #[test]
    fn test_header_layout() {
        let header = wav_header(PcmFormat::default(), 200).unwrap();

        assert_eq!(header.len() as u64, WAV_HEADER_LEN);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([header[4], header[5], header[6], header[7]]), 236);
        assert_eq!(&header[8..16], b"WAVEfmt ");
        assert_eq!(&header[36..40], b"data");
        assert_eq!(u32::from_le_bytes([header[40], header[41], header[42], header[43]]), 200);
    }

    #[test]
    fn test_header_and_samples_read_back() {
        let samples: Vec<i16> = (0..100i16).map(|s| s * 3 - 150).collect();
        let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut file = wav_header(PcmFormat::mono_16bit(16000), pcm.len() as u32).unwrap();
        file.extend_from_slice(&pcm);

        let (header, data) = wav::read(&mut Cursor::new(file)).unwrap();
        assert_eq!(header.sampling_rate, 16000);
        assert_eq!(header.channel_count, 1);
        assert_eq!(data.as_sixteen(), Some(&samples));
    }

    #[test]
    fn test_unsupported_bit_depth() {
        let format = PcmFormat {
            bits_per_sample: 24,
            ..PcmFormat::default()
        };
        assert!(wav_header(format, 0).is_err());
    }
}
