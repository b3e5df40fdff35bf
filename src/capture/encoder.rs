//! Turns raw microphone chunks into wire-ready PCM16 frames.

use crate::audio::{encode_pcm16_le, resample, stereo_to_mono, AudioChunk};

/// Downmixes, resamples to the wire rate, converts to PCM16 and splits the
/// result into frames of at most `frame_samples` samples.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    target_rate: u32,
    frame_samples: usize,
}

impl FrameEncoder {
    pub fn new(target_rate: u32, frame_samples: usize) -> Self {
        Self {
            target_rate,
            frame_samples: frame_samples.max(1),
        }
    }

    /// Encode one chunk into zero or more little-endian PCM16 frames.
    pub fn encode(&self, chunk: &AudioChunk) -> Vec<Vec<u8>> {
        let mono = stereo_to_mono(&chunk.samples, chunk.channels);
        let samples = resample(&mono, chunk.sample_rate, self.target_rate);
        samples
            .chunks(self.frame_samples)
            .map(encode_pcm16_le)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(samples: Vec<f32>, sample_rate: u32, channels: u16) -> AudioChunk {
        AudioChunk {
            samples,
            sample_rate,
            channels,
        }
    }

    #[test]
    fn wire_rate_mono_keeps_sample_count() {
        let encoder = FrameEncoder::new(16_000, 4_096);
        let frames = encoder.encode(&chunk(vec![0.1; 4_096], 16_000, 1));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 4_096 * 2);
    }

    #[test]
    fn large_chunks_are_split() {
        let encoder = FrameEncoder::new(16_000, 4_096);
        let frames = encoder.encode(&chunk(vec![0.0; 10_000], 16_000, 1));
        let sizes: Vec<usize> = frames.iter().map(|f| f.len() / 2).collect();
        assert_eq!(sizes, vec![4_096, 4_096, 1_808]);
    }

    #[test]
    fn stereo_48k_becomes_mono_16k() {
        let encoder = FrameEncoder::new(16_000, 4_096);
        // 480 stereo frames at 48 kHz → 160 mono samples at 16 kHz.
        let frames = encoder.encode(&chunk(vec![0.5; 960], 48_000, 2));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 160 * 2);
    }

    #[test]
    fn empty_chunk_yields_no_frames() {
        let encoder = FrameEncoder::new(16_000, 4_096);
        assert!(encoder.encode(&chunk(Vec::new(), 16_000, 1)).is_empty());
    }

    #[test]
    fn samples_use_asymmetric_scaling() {
        let encoder = FrameEncoder::new(16_000, 8);
        let frames = encoder.encode(&chunk(vec![1.0, -1.0], 16_000, 1));
        assert_eq!(frames[0], vec![0xff, 0x7f, 0x00, 0x80]);
    }
}
