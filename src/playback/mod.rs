//! Inbound audio: decode each chunk and play it through the output device,
//! one at a time, in arrival order.

pub mod decoder;
pub mod queue;

pub use decoder::{ContainerGuess, DecodeError, DecodeStrategy, DecoderChain, ManualPcm};
pub use queue::{ChunkEncoding, InboundChunk, PlaybackQueue, PlaybackStats};
