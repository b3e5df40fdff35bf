//! Outbound audio: microphone frames encoded as PCM16 and sent while the
//! session is active.

pub mod encoder;
pub mod pipeline;

pub use encoder::FrameEncoder;
pub use pipeline::{CapturePipeline, CaptureStats};
