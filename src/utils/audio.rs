//! PCM and WAV helpers

use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Invalid WAV data: {0}")]
    InvalidWav(#[from] hound::Error),

    #[error("WAV has no channels")]
    NoChannels,
}

/// Decode a WAV payload into mono f32 samples and its sample rate
///
/// Integer and float encodings are accepted; multi-channel audio is
/// downmixed by averaging.
pub fn decode_wav(bytes: &[u8]) -> Result<(Vec<f32>, u32), AudioError> {
    let reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;
    if channels == 0 {
        return Err(AudioError::NoChannels);
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<_, _>>()?
        }
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
    };

    let mono = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok((mono, spec.sample_rate))
}

/// Convert one sample to signed 16-bit, clamping out-of-range input
#[inline]
pub fn sample_to_i16(sample: f32) -> i16 {
    let clamped = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    (clamped * i16::MAX as f32).round() as i16
}

/// Encode samples as 16-bit little-endian PCM
pub fn pcm16_le_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }
    out
}

/// Wrap 16-bit little-endian PCM in a mono WAV container
pub fn wav_from_pcm16(pcm: &[u8], sample_rate: u32) -> Result<Vec<u8>, AudioError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        let mut samples = writer.get_i16_writer((pcm.len() / 2) as u32);
        for pair in pcm.chunks_exact(2) {
            samples.write_sample(i16::from_le_bytes([pair[0], pair[1]]));
        }
        samples.flush()?;
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Encode f32 samples as a mono 16-bit WAV
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>, AudioError> {
    wav_from_pcm16(&pcm16_le_bytes(samples), sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_conversion_clamps() {
        assert_eq!(sample_to_i16(0.0), 0);
        assert_eq!(sample_to_i16(1.0), i16::MAX);
        assert_eq!(sample_to_i16(2.5), i16::MAX);
        assert_eq!(sample_to_i16(-1.0), -i16::MAX);
        assert_eq!(sample_to_i16(f32::NAN), 0);
    }

    #[test]
    fn test_pcm16_is_little_endian() {
        let bytes = pcm16_le_bytes(&[1.0, 0.0]);
        assert_eq!(bytes, vec![0xFF, 0x7F, 0x00, 0x00]);
    }

    #[test]
    fn test_wav_decode_of_encoded_audio() {
        let samples = vec![0.0, 0.5, -0.5, 0.25];
        let wav = encode_wav(&samples, 16_000).unwrap();
        assert_eq!(&wav[..4], b"RIFF");

        let (decoded, rate) = decode_wav(&wav).unwrap();
        assert_eq!(rate, 16_000);
        assert_eq!(decoded.len(), samples.len());
        for (a, b) in decoded.iter().zip(&samples) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_stereo_is_downmixed() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8_000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for s in [0.2f32, 0.4, -1.0, 1.0] {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        let (mono, _) = decode_wav(&cursor.into_inner()).unwrap();
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.3).abs() < 1e-6);
        assert!(mono[1].abs() < 1e-6);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(decode_wav(b"definitely not a wav").is_err());
    }
}
