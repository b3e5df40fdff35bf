//! Real-time voice calls against a conversational voice service.
//!
//! # Layout
//!
//! - [`transport`]: WebSocket channel with JSON envelopes and automatic
//!   reconnection.
//! - [`session`]: call state machine and the controller that drives a call.
//! - [`capture`]: microphone frames to base64 PCM16 envelopes, gated on the
//!   session being active.
//! - [`playback`]: strictly sequential playback of inbound audio chunks.
//! - [`audio`]: cpal devices and sample conversion.
//! - [`config`]: TOML settings.

pub mod audio;
pub mod capture;
pub mod config;
pub mod playback;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;
