//! # Remote Speech Recognition
//!
//! A client and a server that stream audio over one TCP connection and
//! return recognition results.
//!
//! ## Layers:
//! - **remoting**: framed envelopes routed to mailboxes over a socket
//! - **audio**: sample formats, codecs and the decoder-side byte pipe
//! - **transcription**: the recognizer interface and the result model
//! - **protocol**: the message kinds and the two session state machines
//! - **config / state / error**: settings, shared counters and the error type

pub mod audio;
pub mod config;
pub mod error;
pub mod protocol;
pub mod remoting;
pub mod state;
pub mod transcription;
