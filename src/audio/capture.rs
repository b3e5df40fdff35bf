//! Microphone capture via `cpal`.
//!
//! [`MicrophoneSource`] is the seam between the capture pipeline and the
//! hardware.  [`CpalMicrophone`] opens a cpal input stream on a dedicated
//! thread (cpal streams are not `Send` on every platform) and forwards
//! [`AudioChunk`]s over an mpsc channel.  The returned [`InputStream`] is a
//! RAII guard: dropping it stops the stream and releases the device.

use std::sync::mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;

use crate::config::CaptureConfig;

// ---------------------------------------------------------------------------
// AudioChunk
// ---------------------------------------------------------------------------

/// A single buffer of raw audio as delivered by the cpal callback.
///
/// Samples are interleaved `f32` in the range `[-1.0, 1.0]`.
/// Use [`crate::audio::stereo_to_mono`] to downmix channels and
/// [`crate::audio::resample_to_16k`] to convert to the wire rate.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Interleaved PCM samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    /// Sample rate of this chunk in Hz (e.g. 44100, 48000, 16000).
    pub sample_rate: u32,
    /// Number of interleaved channels (1 = mono, 2 = stereo, …).
    pub channels: u16,
}

// ---------------------------------------------------------------------------
// DeviceError
// ---------------------------------------------------------------------------

/// Failure to acquire the microphone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("no microphone found: {0}")]
    NotFound(String),

    #[error("could not open microphone: {0}")]
    Acquisition(String),
}

impl DeviceError {
    /// Text suitable for showing to the person making the call.
    pub fn user_message(&self) -> String {
        match self {
            DeviceError::PermissionDenied(_) => {
                "Microphone access was denied. Allow microphone access for this \
                 application in your system privacy settings and try again."
                    .into()
            }
            DeviceError::NotFound(_) => {
                "No microphone was found. Connect a microphone or pick another \
                 input device in the settings file and try again."
                    .into()
            }
            DeviceError::Acquisition(detail) => {
                format!("The microphone could not be opened ({detail}). Close other applications using it and try again.")
            }
        }
    }
}

/// Substrings that backends use when the OS refuses microphone access.
const PERMISSION_HINTS: &[&str] = &["permission", "denied", "not authorized", "unauthorized"];

/// Classify a cpal error into a [`DeviceError`].
fn classify(err: impl std::fmt::Display, device_missing: bool) -> DeviceError {
    let text = err.to_string();
    if device_missing {
        return DeviceError::NotFound(text);
    }
    let lower = text.to_lowercase();
    if PERMISSION_HINTS.iter().any(|hint| lower.contains(hint)) {
        DeviceError::PermissionDenied(text)
    } else {
        DeviceError::Acquisition(text)
    }
}

// ---------------------------------------------------------------------------
// MicrophoneSource
// ---------------------------------------------------------------------------

/// Keeps an opened input device alive.  Dropping it releases the device.
pub trait InputStream: Send {
    fn device_name(&self) -> &str;
}

/// Something that can open a microphone and stream chunks into `tx`.
pub trait MicrophoneSource: Send + Sync {
    /// Open the input device described by `config`.
    ///
    /// Must not return until the device is either streaming or has failed,
    /// so callers can surface [`DeviceError`]s synchronously.
    fn open(
        &self,
        config: &CaptureConfig,
        tx: mpsc::Sender<AudioChunk>,
    ) -> Result<Box<dyn InputStream>, DeviceError>;
}

// ---------------------------------------------------------------------------
// CpalMicrophone
// ---------------------------------------------------------------------------

/// Microphone backed by the default cpal host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    pub fn new() -> Self {
        Self
    }
}

impl MicrophoneSource for CpalMicrophone {
    fn open(
        &self,
        config: &CaptureConfig,
        tx: mpsc::Sender<AudioChunk>,
    ) -> Result<Box<dyn InputStream>, DeviceError> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<String, DeviceError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let config = config.clone();

        let thread = std::thread::Builder::new()
            .name("mic-stream".into())
            .spawn(move || {
                let stream = match build_input_stream(&config, tx) {
                    Ok((stream, name)) => {
                        let _ = ready_tx.send(Ok(name));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Park until the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| DeviceError::Acquisition(format!("failed to spawn capture thread: {e}")))?;

        let device_name = match ready_rx.recv() {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(DeviceError::Acquisition("capture thread exited".into()));
            }
        };

        Ok(Box::new(CpalInput {
            device_name,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        }))
    }
}

/// RAII guard for a running cpal input stream.
struct CpalInput {
    device_name: String,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl InputStream for CpalInput {
    fn device_name(&self) -> &str {
        &self.device_name
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("capture: mic-stream thread panicked");
            }
        }
    }
}

fn select_input_device(
    host: &cpal::Host,
    wanted: Option<&str>,
) -> Result<cpal::Device, DeviceError> {
    match wanted {
        Some(name) => {
            let mut devices = host.input_devices().map_err(|e| classify(e, false))?;
            devices
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| DeviceError::NotFound(format!("input device {name:?}")))
        }
        None => host
            .default_input_device()
            .ok_or_else(|| DeviceError::NotFound("no default input device".into())),
    }
}

/// Prefer a mono stream at the wire rate; fall back to the device default
/// and let the encoder downmix/resample.
fn choose_config(
    device: &cpal::Device,
    config: &CaptureConfig,
) -> Result<(cpal::StreamConfig, cpal::SampleFormat), DeviceError> {
    let wanted = cpal::SampleRate(config.sample_rate);
    let exact = device
        .supported_input_configs()
        .map_err(|e| {
            let missing = matches!(e, cpal::SupportedStreamConfigsError::DeviceNotAvailable);
            classify(e, missing)
        })?
        .filter(|range| {
            range.channels() == 1
                && range.min_sample_rate() <= wanted
                && range.max_sample_rate() >= wanted
                && matches!(range.sample_format(), cpal::SampleFormat::F32 | cpal::SampleFormat::I16)
        })
        .min_by_key(|range| range.sample_format() != cpal::SampleFormat::F32)
        .map(|range| range.with_sample_rate(wanted));

    let supported = match exact {
        Some(supported) => supported,
        None => device.default_input_config().map_err(|e| {
            let missing = matches!(e, cpal::DefaultStreamConfigError::DeviceNotAvailable);
            classify(e, missing)
        })?,
    };

    let mut stream_config = supported.config();
    if let cpal::SupportedBufferSize::Range { min, max } = supported.buffer_size() {
        let frames = config.frame_samples as u32;
        if (*min..=*max).contains(&frames) {
            stream_config.buffer_size = cpal::BufferSize::Fixed(frames);
        }
    }
    Ok((stream_config, supported.sample_format()))
}

fn build_input_stream(
    config: &CaptureConfig,
    tx: mpsc::Sender<AudioChunk>,
) -> Result<(cpal::Stream, String), DeviceError> {
    let host = cpal::default_host();
    let device = select_input_device(&host, config.device.as_deref())?;
    let name = device.name().unwrap_or_else(|_| "unknown input".into());
    let (stream_config, format) = choose_config(&device, config)?;

    // cpal exposes no voice-processing controls; the flags are forwarded to
    // whatever the platform applies by default.
    log::info!(
        "capture: opening {name:?} at {} Hz x{} ({format:?}); echo_cancellation={} noise_suppression={} auto_gain_control={}",
        stream_config.sample_rate.0,
        stream_config.channels,
        config.echo_cancellation,
        config.noise_suppression,
        config.auto_gain_control,
    );

    let sample_rate = stream_config.sample_rate.0;
    let channels = stream_config.channels;
    let err_fn = |err: cpal::StreamError| log::error!("capture: cpal stream error: {err}");

    let stream = match format {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Receiver gone means capture is stopping.
                let _ = tx.send(AudioChunk {
                    samples: data.to_vec(),
                    sample_rate,
                    channels,
                });
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let _ = tx.send(AudioChunk {
                    samples: data.iter().map(|&s| s as f32 / 32768.0).collect(),
                    sample_rate,
                    channels,
                });
            },
            err_fn,
            None,
        ),
        other => {
            return Err(DeviceError::Acquisition(format!(
                "unsupported input sample format {other:?}"
            )))
        }
    }
    .map_err(|e| {
        let missing = matches!(e, cpal::BuildStreamError::DeviceNotAvailable);
        classify(e, missing)
    })?;

    stream.play().map_err(|e| {
        let missing = matches!(e, cpal::PlayStreamError::DeviceNotAvailable);
        classify(e, missing)
    })?;

    Ok((stream, name))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
