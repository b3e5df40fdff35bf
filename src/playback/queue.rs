//! Strictly sequential playback of inbound audio chunks.
//!
//! Chunks are appended to a FIFO.  A single drain task pops, decodes and
//! plays one chunk at a time; the `playing` flag lives under the same lock
//! as the FIFO, so an enqueue racing with the end of a drain either lands in
//! the running drain or starts a new one, never both.  A chunk that fails to
//! decode or play is logged and skipped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::Engine;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::audio::AudioOutput;
use crate::config::PlaybackConfig;
use crate::transport::AudioFormat;

use super::decoder::DecoderChain;

// ---------------------------------------------------------------------------
// InboundChunk
// ---------------------------------------------------------------------------

/// Declared encoding of an inbound chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEncoding {
    Pcm16,
    Wav,
    /// Untagged or compressed; decoded by probing.
    Compressed,
}

impl From<AudioFormat> for ChunkEncoding {
    fn from(format: AudioFormat) -> Self {
        match format {
            AudioFormat::Pcm16 | AudioFormat::Pcm => ChunkEncoding::Pcm16,
            AudioFormat::Wav => ChunkEncoding::Wav,
            AudioFormat::Mp3 | AudioFormat::Unknown => ChunkEncoding::Compressed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InboundChunk {
    pub encoding: ChunkEncoding,
    pub data: Arc<Vec<u8>>,
}

impl InboundChunk {
    pub fn new(encoding: ChunkEncoding, data: Vec<u8>) -> Self {
        Self {
            encoding,
            data: Arc::new(data),
        }
    }

    /// Decode the base64 payload of an `audio_chunk` envelope.
    pub fn from_base64(audio: &str, format: AudioFormat) -> Result<Self, base64::DecodeError> {
        let data = base64::engine::general_purpose::STANDARD.decode(audio.trim())?;
        Ok(Self::new(format.into(), data))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ---------------------------------------------------------------------------
// PlaybackQueue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub played: u64,
    pub failed: u64,
    pub discarded: u64,
}

#[derive(Default)]
struct QueueState {
    chunks: VecDeque<InboundChunk>,
    playing: bool,
    /// Bumped by `clear` so a chunk decoded before the clear is not played.
    epoch: u64,
}

#[derive(Default)]
struct Counters {
    played: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

struct QueueInner {
    state: Mutex<QueueState>,
    output: Arc<dyn AudioOutput>,
    decoders: DecoderChain,
    min_chunk_bytes: usize,
    counters: Counters,
    runtime: Handle,
}

/// Cheap-to-clone handle to the playback FIFO.
#[derive(Clone)]
pub struct PlaybackQueue {
    inner: Arc<QueueInner>,
}

impl PlaybackQueue {
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime; the drain task is spawned
    /// on the runtime that created the queue.
    pub fn new(output: Arc<dyn AudioOutput>, config: &PlaybackConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                output,
                decoders: DecoderChain::from_config(config),
                min_chunk_bytes: config.min_chunk_bytes,
                counters: Counters::default(),
                runtime: Handle::current(),
            }),
        }
    }

    /// Append `chunk` and start draining if nothing is playing.
    ///
    /// Returns `false` when the chunk is below the minimum size and was
    /// discarded.
    pub fn enqueue(&self, chunk: InboundChunk) -> bool {
        if chunk.len() < self.inner.min_chunk_bytes {
            log::debug!(
                "playback: discarding {} byte chunk (minimum {})",
                chunk.len(),
                self.inner.min_chunk_bytes
            );
            self.inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let start_drain = {
            let mut state = self.inner.state.lock();
            state.chunks.push_back(chunk);
            !std::mem::replace(&mut state.playing, true)
        };

        if start_drain {
            let inner = Arc::clone(&self.inner);
            self.inner.runtime.spawn(drain(inner));
        }
        true
    }

    /// Drop everything queued and stop the current output.
    pub fn clear(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            let n = state.chunks.len();
            state.chunks.clear();
            n
        };
        self.inner.output.stop();
        if dropped > 0 {
            log::info!("playback: cleared {dropped} queued chunks");
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.state.lock().chunks.len()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.state.lock().playing
    }

    pub fn stats(&self) -> PlaybackStats {
        let c = &self.inner.counters;
        PlaybackStats {
            played: c.played.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }
}

async fn drain(inner: Arc<QueueInner>) {
    loop {
        let (chunk, epoch) = {
            let mut state = inner.state.lock();
            match state.chunks.pop_front() {
                Some(chunk) => (chunk, state.epoch),
                None => {
                    state.playing = false;
                    return;
                }
            }
        };
        play_one(&inner, chunk, epoch).await;
    }
}

async fn play_one(inner: &QueueInner, chunk: InboundChunk, epoch: u64) {
    let buffer = match inner.decoders.decode(&chunk).await {
        Ok(buffer) => buffer,
        Err(e) => {
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            log::warn!("playback: skipping {} byte chunk: {e}", chunk.len());
            return;
        }
    };

    if inner.state.lock().epoch != epoch {
        log::debug!("playback: queue cleared while decoding; chunk dropped");
        return;
    }

    match inner.output.play(buffer).await {
        Ok(()) => {
            inner.counters.played.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            log::warn!("playback: output failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{wait_until, wav_bytes, RecordingOutput};

    fn pcm_chunk(value: i16, samples: usize) -> InboundChunk {
        let data = std::iter::repeat(value.to_le_bytes())
            .take(samples)
            .flatten()
            .collect();
        InboundChunk::new(ChunkEncoding::Pcm16, data)
    }

    fn queue(output: &Arc<RecordingOutput>) -> PlaybackQueue {
        PlaybackQueue::new(
            Arc::clone(output) as Arc<dyn AudioOutput>,
            &PlaybackConfig::default(),
        )
    }

    #[test]
    fn format_tags_map_to_encodings() {
        assert_eq!(ChunkEncoding::from(AudioFormat::Pcm16), ChunkEncoding::Pcm16);
        assert_eq!(ChunkEncoding::from(AudioFormat::Pcm), ChunkEncoding::Pcm16);
        assert_eq!(ChunkEncoding::from(AudioFormat::Wav), ChunkEncoding::Wav);
        assert_eq!(ChunkEncoding::from(AudioFormat::Mp3), ChunkEncoding::Compressed);
        assert_eq!(
            ChunkEncoding::from(AudioFormat::Unknown),
            ChunkEncoding::Compressed
        );
    }

    #[test]
    fn base64_payload_is_decoded() {
        let chunk = InboundChunk::from_base64("AQD/fw==", AudioFormat::Pcm16).unwrap();
        assert_eq!(chunk.data.as_slice(), &[0x01, 0x00, 0xff, 0x7f]);
        assert!(InboundChunk::from_base64("%%%", AudioFormat::Pcm16).is_err());
    }

    #[tokio::test]
    async fn small_chunks_are_discarded() {
        let output = RecordingOutput::new(Duration::ZERO);
        let q = queue(&output);

        assert!(!q.enqueue(InboundChunk::new(ChunkEncoding::Pcm16, vec![0; 99])));
        assert!(q.enqueue(InboundChunk::new(ChunkEncoding::Pcm16, vec![0; 100])));
        assert!(wait_until(Duration::from_secs(2), || output.played_count() == 1).await);
        assert_eq!(q.stats().discarded, 1);
    }

    #[tokio::test]
    async fn pcm16_chunk_plays_at_wire_rate() {
        let output = RecordingOutput::new(Duration::ZERO);
        let q = queue(&output);

        q.enqueue(pcm_chunk(1_000, 320));
        assert!(wait_until(Duration::from_secs(2), || output.played_count() == 1).await);
        let played = output.played();
        assert_eq!(played[0].samples.len(), 320);
        assert_eq!(played[0].sample_rate, 16_000);
        assert_eq!(played[0].channels, 1);
    }

    #[tokio::test]
    async fn chunks_play_in_order_without_overlap() {
        let output = RecordingOutput::new(Duration::from_millis(30));
        let q = queue(&output);

        for value in 1..=5 {
            assert!(q.enqueue(pcm_chunk(value * 1_000, 100)));
        }
        assert!(wait_until(Duration::from_secs(3), || output.played_count() == 5).await);
        assert!(wait_until(Duration::from_secs(1), || !q.is_playing()).await);

        let firsts: Vec<i32> = output
            .played()
            .iter()
            .map(|b| (b.samples[0] * 32768.0).round() as i32)
            .collect();
        assert_eq!(firsts, vec![1_000, 2_000, 3_000, 4_000, 5_000]);
        assert_eq!(output.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn bad_chunk_is_skipped_and_queue_continues() {
        let output = RecordingOutput::new(Duration::from_millis(10));
        let q = queue(&output);

        let wav = InboundChunk::new(ChunkEncoding::Wav, wav_bytes(&vec![2_000; 400], 16_000));
        let garbage = InboundChunk::new(ChunkEncoding::Compressed, vec![0xab; 301]);
        let pcm = pcm_chunk(3_000, 200);

        assert!(q.enqueue(wav));
        assert!(q.enqueue(garbage));
        assert!(q.enqueue(pcm));

        assert!(wait_until(Duration::from_secs(5), || output.played_count() == 2).await);
        assert!(wait_until(Duration::from_secs(1), || !q.is_playing()).await);
        let played = output.played();
        assert_eq!(played[0].frames(), 400);
        assert_eq!(played[1].frames(), 200);
        assert_eq!(q.stats().failed, 1);
        assert_eq!(q.stats().played, 2);
        assert_eq!(output.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn enqueue_after_drain_restarts_playback() {
        let output = RecordingOutput::new(Duration::ZERO);
        let q = queue(&output);

        q.enqueue(pcm_chunk(1, 100));
        assert!(wait_until(Duration::from_secs(2), || !q.is_playing()
            && output.played_count() == 1)
        .await);
        q.enqueue(pcm_chunk(2, 100));
        assert!(wait_until(Duration::from_secs(2), || output.played_count() == 2).await);
    }

    #[tokio::test]
    async fn clear_drops_pending_chunks() {
        let output = RecordingOutput::new(Duration::from_millis(100));
        let q = queue(&output);

        for value in 1..=4 {
            q.enqueue(pcm_chunk(value, 100));
        }
        assert!(wait_until(Duration::from_secs(2), || output.played_count() == 1).await);
        q.clear();
        assert_eq!(q.pending(), 0);
        assert_eq!(output.stops(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(output.played_count(), 1);
        assert!(!q.is_playing());
    }
}
