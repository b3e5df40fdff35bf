//! Audio hardware and sample conversion.
//!
//! # Pipeline
//!
//! ```text
//! Microphone → cpal callback → AudioChunk (mpsc) → stereo_to_mono
//!           → resample_to_16k → f32_to_pcm16 → outbound frames
//!
//! inbound bytes → decoder → PlayableBuffer → resample → CpalSpeaker
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::mpsc;
//! use voice_call::audio::{AudioChunk, CpalMicrophone, MicrophoneSource};
//! use voice_call::config::CaptureConfig;
//!
//! let (tx, rx) = mpsc::channel::<AudioChunk>();
//! let _input = CpalMicrophone::new()
//!     .open(&CaptureConfig::default(), tx)
//!     .unwrap(); // drop `_input` to release the microphone
//!
//! while let Ok(chunk) = rx.recv() {
//!     println!("received {} samples @ {}Hz", chunk.samples.len(), chunk.sample_rate);
//! }
//! ```

pub mod capture;
pub mod output;
pub mod pcm;
pub mod resample;

pub use capture::{AudioChunk, CpalMicrophone, DeviceError, InputStream, MicrophoneSource};
pub use output::{AudioOutput, CpalSpeaker, PlayableBuffer, PlaybackError};
pub use pcm::{decode_pcm16_le, encode_pcm16_le, f32_to_pcm16};
pub use resample::{mono_to_channels, resample, resample_to_16k, stereo_to_mono};
