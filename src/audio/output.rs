//! Speaker output via `cpal`.
//!
//! [`AudioOutput`] is the seam the playback queue plays through.
//! [`CpalSpeaker`] keeps one output stream open on a dedicated thread and
//! feeds it from a shared sample queue; [`AudioOutput::play`] resolves once
//! the callback has drained everything that call enqueued.

use std::collections::VecDeque;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

use super::resample::{mono_to_channels, resample, stereo_to_mono};

/// Extra time allowed past a buffer's nominal duration before `play` gives up.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// PlayableBuffer
// ---------------------------------------------------------------------------

/// Decoded audio ready for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableBuffer {
    /// Interleaved samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PlayableBuffer {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        match self.channels {
            0 => 0,
            n => self.samples.len() / n as usize,
        }
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }
}

// ---------------------------------------------------------------------------
// PlaybackError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("no output device: {0}")]
    NoDevice(String),

    #[error("output stream failed: {0}")]
    Stream(String),

    #[error("playback was stopped")]
    Interrupted,

    #[error("output did not drain within {0:?}")]
    Stalled(Duration),
}

// ---------------------------------------------------------------------------
// AudioOutput
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play `buffer`, resolving when playback has finished.
    async fn play(&self, buffer: PlayableBuffer) -> Result<(), PlaybackError>;

    /// Discard anything currently playing.
    fn stop(&self);
}

// ---------------------------------------------------------------------------
// CpalSpeaker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct OutputState {
    samples: VecDeque<f32>,
    drained: Option<oneshot::Sender<()>>,
}

impl OutputState {
    fn next_sample(&mut self) -> f32 {
        match self.samples.pop_front() {
            Some(s) => s,
            None => {
                if let Some(done) = self.drained.take() {
                    let _ = done.send(());
                }
                0.0
            }
        }
    }
}

/// Default output device, held open for the life of the value.
pub struct CpalSpeaker {
    state: Arc<Mutex<OutputState>>,
    sample_rate: u32,
    channels: u16,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalSpeaker {
    /// Open `device` (or the host default) for output.
    pub fn open(device: Option<&str>) -> Result<Self, PlaybackError> {
        let state = Arc::new(Mutex::new(OutputState::default()));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(u32, u16), PlaybackError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let wanted = device.map(str::to_string);
        let shared = Arc::clone(&state);

        let thread = std::thread::Builder::new()
            .name("speaker-stream".into())
            .spawn(move || {
                let stream = match build_output_stream(wanted.as_deref(), shared) {
                    Ok((stream, rate, channels)) => {
                        let _ = ready_tx.send(Ok((rate, channels)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| PlaybackError::Stream(format!("failed to spawn output thread: {e}")))?;

        let (sample_rate, channels) = match ready_rx.recv() {
            Ok(Ok(format)) => format,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(PlaybackError::Stream("output thread exited".into()));
            }
        };

        log::info!("playback: output open at {sample_rate} Hz x{channels}");
        Ok(Self {
            state,
            sample_rate,
            channels,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

#[async_trait]
impl AudioOutput for CpalSpeaker {
    async fn play(&self, buffer: PlayableBuffer) -> Result<(), PlaybackError> {
        let limit = buffer.duration() + DRAIN_GRACE;
        let mono = stereo_to_mono(&buffer.samples, buffer.channels);
        let resampled = resample(&mono, buffer.sample_rate, self.sample_rate);
        let frames = mono_to_channels(&resampled, self.channels);
        if frames.is_empty() {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            state.samples.extend(frames);
            state.drained = Some(tx);
        }

        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PlaybackError::Interrupted),
            Err(_) => {
                self.stop();
                Err(PlaybackError::Stalled(limit))
            }
        }
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        state.samples.clear();
        // Dropping the sender wakes the pending `play` with `Interrupted`.
        state.drained = None;
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn build_output_stream(
    wanted: Option<&str>,
    state: Arc<Mutex<OutputState>>,
) -> Result<(cpal::Stream, u32, u16), PlaybackError> {
    let host = cpal::default_host();
    let device = match wanted {
        Some(name) => host
            .output_devices()
            .map_err(|e| PlaybackError::NoDevice(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| PlaybackError::NoDevice(format!("output device {name:?}")))?,
        None => host
            .default_output_device()
            .ok_or_else(|| PlaybackError::NoDevice("no default output device".into()))?,
    };

    let supported = device
        .default_output_config()
        .map_err(|e| PlaybackError::NoDevice(e.to_string()))?;
    let format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let err_fn = |err: cpal::StreamError| log::error!("playback: cpal stream error: {err}");

    let stream = match format {
        cpal::SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut state = state.lock();
                for slot in data.iter_mut() {
                    *slot = state.next_sample();
                }
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                let mut state = state.lock();
                for slot in data.iter_mut() {
                    *slot = crate::audio::f32_to_pcm16(state.next_sample());
                }
            },
            err_fn,
            None,
        ),
        other => {
            return Err(PlaybackError::Stream(format!(
                "unsupported output sample format {other:?}"
            )))
        }
    }
    .map_err(|e| PlaybackError::Stream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| PlaybackError::Stream(e.to_string()))?;

    Ok((stream, config.sample_rate.0, config.channels))
}
