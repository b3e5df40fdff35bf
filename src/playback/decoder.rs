//! Decode strategies for inbound audio chunks.
//!
//! Each [`DecodeStrategy`] is a pure function from bytes to a
//! [`PlayableBuffer`].  [`DecoderChain`] picks the ordered list of strategies
//! for a chunk's declared encoding and tries them in turn:
//!
//! * `Pcm16` / `Wav` chunks go straight to [`ManualPcm`].
//! * Anything else is probed as MP3, then WAV, via symphonia (each attempt
//!   bounded by the configured timeout), then falls back to [`ManualPcm`].

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{
    CodecType, DecoderOptions, CODEC_TYPE_MP3, CODEC_TYPE_PCM_F32LE, CODEC_TYPE_PCM_F64LE,
    CODEC_TYPE_PCM_S16LE, CODEC_TYPE_PCM_S24LE, CODEC_TYPE_PCM_S32LE, CODEC_TYPE_PCM_U8,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use crate::audio::{decode_pcm16_le, PlayableBuffer};
use crate::config::PlaybackConfig;

use super::queue::{ChunkEncoding, InboundChunk};

// ---------------------------------------------------------------------------
// DecodeError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("chunk is empty")]
    Empty,

    #[error("{0} bytes is not a whole number of 16-bit samples")]
    OddLength(usize),

    #[error("invalid WAV data: {0}")]
    Wav(String),

    #[error("not decodable as {mime}: {reason}")]
    Container { mime: &'static str, reason: String },

    #[error("{strategy} gave up after {limit:?}")]
    Timeout {
        strategy: &'static str,
        limit: Duration,
    },

    #[error("no decoder accepted the chunk ({0})")]
    Exhausted(String),
}

// ---------------------------------------------------------------------------
// DecodeStrategy
// ---------------------------------------------------------------------------

pub trait DecodeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn decode(&self, bytes: &[u8]) -> Result<PlayableBuffer, DecodeError>;

    /// Whether attempts run under the per-attempt timeout.
    fn bounded(&self) -> bool {
        false
    }
}

// ----- ManualPcm -----

/// RIFF data is parsed with hound; anything else is raw PCM16 LE mono.
#[derive(Debug, Clone, Copy)]
pub struct ManualPcm {
    pub sample_rate: u32,
}

impl DecodeStrategy for ManualPcm {
    fn name(&self) -> &'static str {
        "manual-pcm"
    }

    fn decode(&self, bytes: &[u8]) -> Result<PlayableBuffer, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        if bytes.starts_with(b"RIFF") {
            return decode_wav(bytes);
        }
        let samples = decode_pcm16_le(bytes).ok_or(DecodeError::OddLength(bytes.len()))?;
        Ok(PlayableBuffer::mono(samples, self.sample_rate))
    }
}

/// Parse a RIFF/WAVE container.
pub fn decode_wav(bytes: &[u8]) -> Result<PlayableBuffer, DecodeError> {
    let reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| DecodeError::Wav(e.to_string()))?;
    let spec = reader.spec();

    let samples: Result<Vec<f32>, hound::Error> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect(),
        hound::SampleFormat::Int if spec.bits_per_sample <= 16 => {
            let scale = 2f32.powi(spec.bits_per_sample as i32 - 1);
            reader
                .into_samples::<i16>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect()
        }
        hound::SampleFormat::Int => {
            let scale = 2f32.powi(spec.bits_per_sample as i32 - 1);
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect()
        }
    };
    let samples = samples.map_err(|e| DecodeError::Wav(e.to_string()))?;

    if samples.is_empty() {
        return Err(DecodeError::Wav("no samples".into()));
    }
    Ok(PlayableBuffer {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

// ----- ContainerGuess -----

/// Probe the bytes as a specific container type with symphonia; succeeds
/// only if the detected codec is one this guess expects.
#[derive(Debug, Clone, Copy)]
pub struct ContainerGuess {
    mime: &'static str,
    accepts: fn(CodecType) -> bool,
}

const PCM_CODECS: &[CodecType] = &[
    CODEC_TYPE_PCM_S16LE,
    CODEC_TYPE_PCM_S24LE,
    CODEC_TYPE_PCM_S32LE,
    CODEC_TYPE_PCM_F32LE,
    CODEC_TYPE_PCM_F64LE,
    CODEC_TYPE_PCM_U8,
];

fn is_mp3(codec: CodecType) -> bool {
    codec == CODEC_TYPE_MP3
}

fn is_pcm(codec: CodecType) -> bool {
    PCM_CODECS.contains(&codec)
}

impl ContainerGuess {
    pub fn mpeg() -> Self {
        Self {
            mime: "audio/mpeg",
            accepts: is_mp3,
        }
    }

    pub fn mp3() -> Self {
        Self {
            mime: "audio/mp3",
            accepts: is_mp3,
        }
    }

    pub fn wav() -> Self {
        Self {
            mime: "audio/wav",
            accepts: is_pcm,
        }
    }
}

impl DecodeStrategy for ContainerGuess {
    fn name(&self) -> &'static str {
        self.mime
    }

    fn bounded(&self) -> bool {
        true
    }

    fn decode(&self, bytes: &[u8]) -> Result<PlayableBuffer, DecodeError> {
        let mime = self.mime;
        let fail = |reason: String| DecodeError::Container { mime, reason };

        let source = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());
        let mut hint = Hint::new();
        hint.mime_type(mime);

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                source,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| fail(e.to_string()))?;
        let mut format = probed.format;

        let track = format
            .default_track()
            .ok_or_else(|| fail("no audio track".into()))?;
        if !(self.accepts)(track.codec_params.codec) {
            return Err(fail(format!(
                "found codec {:?} instead",
                track.codec_params.codec
            )));
        }
        let track_id = track.id;
        let params = track.codec_params.clone();

        let mut decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| fail(e.to_string()))?;

        let mut samples = Vec::new();
        let mut sample_rate = params.sample_rate.unwrap_or(0);
        let mut channels = params.channels.map(|c| c.count() as u16).unwrap_or(0);

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break
                }
                Err(e) => return Err(fail(e.to_string())),
            };
            if packet.track_id() != track_id {
                continue;
            }
            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    sample_rate = spec.rate;
                    channels = spec.channels.count() as u16;
                    let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buf.copy_interleaved_ref(decoded);
                    samples.extend_from_slice(buf.samples());
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    log::debug!("playback: skipping corrupt {mime} packet: {e}");
                }
                Err(e) => return Err(fail(e.to_string())),
            }
        }

        if samples.is_empty() || sample_rate == 0 || channels == 0 {
            return Err(fail("no samples decoded".into()));
        }
        Ok(PlayableBuffer {
            samples,
            sample_rate,
            channels,
        })
    }
}

// ---------------------------------------------------------------------------
// DecoderChain
// ---------------------------------------------------------------------------

/// Ordered decode attempts per declared encoding.
pub struct DecoderChain {
    tagged: Vec<Arc<dyn DecodeStrategy>>,
    untagged: Vec<Arc<dyn DecodeStrategy>>,
    attempt_timeout: Duration,
}

impl DecoderChain {
    pub fn from_config(config: &PlaybackConfig) -> Self {
        let manual: Arc<dyn DecodeStrategy> = Arc::new(ManualPcm {
            sample_rate: config.pcm_sample_rate,
        });
        Self {
            tagged: vec![Arc::clone(&manual)],
            untagged: vec![
                Arc::new(ContainerGuess::mpeg()),
                Arc::new(ContainerGuess::mp3()),
                Arc::new(ContainerGuess::wav()),
                manual,
            ],
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }

    pub fn strategies_for(&self, encoding: ChunkEncoding) -> &[Arc<dyn DecodeStrategy>] {
        match encoding {
            ChunkEncoding::Pcm16 | ChunkEncoding::Wav => &self.tagged,
            ChunkEncoding::Compressed => &self.untagged,
        }
    }

    /// Try each strategy in order on the blocking pool; the first success wins.
    pub async fn decode(&self, chunk: &InboundChunk) -> Result<PlayableBuffer, DecodeError> {
        let mut failures = Vec::new();

        for strategy in self.strategies_for(chunk.encoding) {
            let name = strategy.name();
            let attempt = {
                let strategy = Arc::clone(strategy);
                let bytes = Arc::clone(&chunk.data);
                tokio::task::spawn_blocking(move || strategy.decode(&bytes))
            };

            let joined = if strategy.bounded() {
                match tokio::time::timeout(self.attempt_timeout, attempt).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        let err = DecodeError::Timeout {
                            strategy: name,
                            limit: self.attempt_timeout,
                        };
                        log::debug!("playback: {err}");
                        failures.push(err.to_string());
                        continue;
                    }
                }
            } else {
                attempt.await
            };

            match joined {
                Ok(Ok(buffer)) => {
                    log::debug!(
                        "playback: {name} decoded {} frames @ {} Hz",
                        buffer.frames(),
                        buffer.sample_rate
                    );
                    return Ok(buffer);
                }
                Ok(Err(e)) => {
                    log::debug!("playback: {name} rejected chunk: {e}");
                    failures.push(e.to_string());
                }
                Err(e) => failures.push(format!("{name} panicked: {e}")),
            }
        }

        Err(DecodeError::Exhausted(failures.join("; ")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::wav_bytes;

    fn manual() -> ManualPcm {
        ManualPcm {
            sample_rate: 16_000,
        }
    }

    #[test]
    fn raw_pcm_keeps_sample_count() {
        let bytes: Vec<u8> = (0..400u16).flat_map(|i| (i as i16).to_le_bytes()).collect();
        let buffer = manual().decode(&bytes).unwrap();
        assert_eq!(buffer.samples.len(), 400);
        assert_eq!(buffer.sample_rate, 16_000);
        assert_eq!(buffer.channels, 1);
    }

    #[test]
    fn raw_pcm_odd_length_fails() {
        assert_eq!(manual().decode(&[0u8; 301]), Err(DecodeError::OddLength(301)));
    }

    #[test]
    fn riff_goes_through_hound() {
        let bytes = wav_bytes(&[0, 16_384, -16_384, 32_767], 22_050);
        let buffer = manual().decode(&bytes).unwrap();
        assert_eq!(buffer.sample_rate, 22_050);
        assert_eq!(buffer.samples.len(), 4);
        assert!((buffer.samples[1] - 0.5).abs() < 1e-6);
        assert!((buffer.samples[2] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn truncated_riff_is_an_error() {
        assert!(matches!(
            manual().decode(b"RIFF\x10\x00\x00\x00WAVE"),
            Err(DecodeError::Wav(_))
        ));
    }

    #[test]
    fn empty_chunk_is_an_error() {
        assert_eq!(manual().decode(&[]), Err(DecodeError::Empty));
    }

    #[test]
    fn container_guess_rejects_garbage() {
        let garbage = vec![0xab_u8; 301];
        for guess in [ContainerGuess::mpeg(), ContainerGuess::mp3(), ContainerGuess::wav()] {
            assert!(matches!(
                guess.decode(&garbage),
                Err(DecodeError::Container { .. })
            ));
        }
    }

    #[test]
    fn wav_guess_decodes_wav() {
        let bytes = wav_bytes(&vec![1_000; 800], 16_000);
        let buffer = ContainerGuess::wav().decode(&bytes).unwrap();
        assert_eq!(buffer.sample_rate, 16_000);
        assert_eq!(buffer.frames(), 800);
    }

    #[test]
    fn mp3_guess_rejects_wav() {
        let bytes = wav_bytes(&vec![1_000; 800], 16_000);
        assert!(ContainerGuess::mp3().decode(&bytes).is_err());
    }

    #[test]
    fn tagged_chunks_skip_container_guesses() {
        let chain = DecoderChain::from_config(&PlaybackConfig::default());
        let names = |e| {
            chain
                .strategies_for(e)
                .iter()
                .map(|s| s.name())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(ChunkEncoding::Pcm16), vec!["manual-pcm"]);
        assert_eq!(names(ChunkEncoding::Wav), vec!["manual-pcm"]);
        assert_eq!(
            names(ChunkEncoding::Compressed),
            vec!["audio/mpeg", "audio/mp3", "audio/wav", "manual-pcm"]
        );
    }

    #[tokio::test]
    async fn untagged_pcm_falls_through_to_manual() {
        let chain = DecoderChain::from_config(&PlaybackConfig::default());
        let pcm: Vec<u8> = std::iter::repeat([0x10, 0x00]).take(200).flatten().collect();
        let chunk = InboundChunk::new(ChunkEncoding::Compressed, pcm);
        let buffer = chain.decode(&chunk).await.unwrap();
        assert_eq!(buffer.samples.len(), 200);
    }

    #[tokio::test]
    async fn undecodable_chunk_reports_every_attempt() {
        let chain = DecoderChain::from_config(&PlaybackConfig::default());
        let chunk = InboundChunk::new(ChunkEncoding::Compressed, vec![0xab; 301]);
        match chain.decode(&chunk).await {
            Err(DecodeError::Exhausted(detail)) => {
                assert!(detail.contains("audio/mpeg"));
                assert!(detail.contains("16-bit"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
}
