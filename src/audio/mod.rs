//! # Audio Pipeline Adapter
//!
//! Everything between float samples and the bytes carried by `SEND_AUDIO`
//! envelopes.
//!
//! ## Key Components:
//! - **Sample format**: rate/channel description and PCM <-> float conversion
//! - **Audio pipe**: byte FIFO the server session fills and a decoder drains
//! - **Codecs**: pcm, ulaw and streaming wav encoders/decoders, plus the
//!   registry that builds them from a negotiated `"<codec>|<params>"` header
//!
//! ## Sample Representation:
//! Interleaved `f32` in [-1.0, 1.0] at the stream's native rate. Resampling
//! is left to the recognition engine.

pub mod codec;
pub mod format;
pub mod pipe;

pub use codec::{AudioDecoder, AudioEncoder, CodecKind, CodecRegistry};
pub use format::AudioSampleFormat;
pub use pipe::AudioPipe;
