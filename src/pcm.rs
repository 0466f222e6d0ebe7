//! PCM sample conversion and transport encoding.
//!
//! Everything on the wire is raw 16-bit signed little-endian PCM wrapped in
//! base64. Capture quantizes f32 microphone samples to i16; playback reverses
//! the trip at the other sample rate.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Error type for PCM decode operations.
#[derive(Debug, thiserror::Error)]
pub enum PcmError {
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM byte stream has odd length {0}")]
    OddLength(usize),
}

/// Convert f32 samples in `[-1.0, 1.0]` to i16.
///
/// Uses `round(sample * 32767)`; inputs outside the nominal range saturate.
pub fn quantize(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|s| (s * 32767.0).round() as i16).collect()
}

/// Convert i16 samples back to f32 via `sample / 32768`.
pub fn dequantize(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|s| *s as f32 / 32768.0).collect()
}

/// Serialize i16 samples as little-endian bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Reinterpret little-endian bytes as i16 samples.
pub fn bytes_to_samples(bytes: &[u8]) -> Result<Vec<i16>, PcmError> {
    if bytes.len() % 2 != 0 {
        return Err(PcmError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}

/// Reinterpret little-endian bytes as f32 samples (device frame format).
pub fn floats_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Package a buffer of i16 samples for transport: little-endian bytes, base64.
pub fn encode_chunk(samples: &[i16]) -> String {
    STANDARD.encode(samples_to_bytes(samples))
}

/// Unpack a transport chunk to f32 playback samples.
pub fn decode_chunk(b64: &str) -> Result<Vec<f32>, PcmError> {
    let bytes = STANDARD.decode(b64)?;
    let samples = bytes_to_samples(&bytes)?;
    Ok(dequantize(&samples))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantize_round_trips_within_quantization_error() {
        let mut samples = vec![-1.0f32, -0.731, -0.5, -0.001, 0.0, 0.001, 0.25, 0.5, 0.9999];
        for i in 0..1000 {
            samples.push(i as f32 / 1000.0 - 0.5);
        }

        let quantized = quantize(&samples);
        let restored = dequantize(&quantized);
        for (orig, back) in samples.iter().zip(restored.iter()) {
            assert!(
                (orig - back).abs() <= 1.0 / 32768.0,
                "{} round-tripped to {}",
                orig,
                back
            );
        }
    }

    #[test]
    fn encoded_chunk_is_two_bytes_per_sample() {
        for n in [0usize, 1, 7, 4096] {
            let samples = vec![123i16; n];
            let encoded = encode_chunk(&samples);
            let bytes = STANDARD.decode(encoded).unwrap();
            assert_eq!(bytes.len(), 2 * n);
        }
    }

    #[test]
    fn sample_bytes_are_little_endian() {
        assert_eq!(samples_to_bytes(&[0x0102]), vec![0x02, 0x01]);
        assert_eq!(samples_to_bytes(&[-2]), vec![0xfe, 0xff]);
        assert_eq!(bytes_to_samples(&[0x02, 0x01]).unwrap(), vec![0x0102]);
    }

    #[test]
    fn zero_samples_encode_to_zero_bytes() {
        let encoded = encode_chunk(&[0i16; 4096]);
        let bytes = STANDARD.decode(encoded).unwrap();
        assert_eq!(bytes.len(), 8192);
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn decode_chunk_scales_by_32768() {
        let encoded = encode_chunk(&[16384, -16384, 32767, -32768]);
        let floats = decode_chunk(&encoded).unwrap();
        assert_eq!(floats, vec![0.5, -0.5, 32767.0 / 32768.0, -1.0]);
    }

    #[test]
    fn odd_byte_count_is_rejected() {
        let b64 = STANDARD.encode([0u8, 0, 0]);
        match decode_chunk(&b64) {
            Err(PcmError::OddLength(3)) => {}
            other => panic!("expected OddLength error, got {:?}", other),
        }
    }

    #[test]
    fn malformed_base64_is_rejected() {
        assert!(matches!(decode_chunk("not base64!!!"), Err(PcmError::Base64(_))));
    }

    #[test]
    fn extreme_inputs_saturate() {
        let quantized = quantize(&[2.0, -2.0]);
        assert_eq!(quantized, vec![32767, -32768]);
    }
}
