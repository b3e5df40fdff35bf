//! 16-bit PCM conversion.
//!
//! Outbound conversion scales negative samples by 0x8000 and non-negative
//! samples by 0x7FFF after clamping to `[-1.0, 1.0]`; the remote decoder
//! relies on this exact mapping.  Inbound conversion divides by 32768.

/// Convert one float sample to signed 16-bit PCM.
///
/// ```rust
/// use voice_call::audio::f32_to_pcm16;
///
/// assert_eq!(f32_to_pcm16(1.0), 32767);
/// assert_eq!(f32_to_pcm16(-1.0), -32768);
/// assert_eq!(f32_to_pcm16(2.5), 32767);
/// ```
pub fn f32_to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Encode float samples as little-endian PCM16 bytes.
pub fn encode_pcm16_le(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        bytes.extend_from_slice(&f32_to_pcm16(s).to_le_bytes());
    }
    bytes
}

/// Decode little-endian PCM16 bytes into floats in `[-1.0, 1.0)`.
///
/// Returns `None` when `bytes` has an odd length.
pub fn decode_pcm16_le(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect(),
    )
}
