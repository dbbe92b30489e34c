//! # Error Handling
//!
//! This module defines the error type shared by the transport, the audio
//! adapters and both protocol state machines.
//!
//! ## Error Categories:
//! - **Connection**: socket connect/accept/read/write failures; fatal to the session
//! - **Timeout**: nothing arrived within the per-operation deadline; fatal to the session
//! - **UnsupportedCodec**: the audio header named a codec we cannot decode
//! - **Protocol**: malformed payloads (bad UTF-8, bad JSON, bad codec params)
//! - **Engine**: the recognition engine failed
//! - **Config**: configuration file or environment variable problems
//! - **Cancelled**: the caller's cancellation token fired
//!
//! ## Key Rust Concepts:
//! - **enum with data**: each variant carries the message for its category
//! - **From trait**: lets `?` convert io, JSON and config errors automatically
//! - **type alias**: `SrResult<T>` saves repeating the error type
//!
//! ## Propagation:
//! Nothing in this crate retries. Transport-level failures are caught at the
//! top of each state machine and turned into a terminal session outcome:
//! an `Error`-status result on the client, connection teardown on the server.

use std::fmt;  // Display for human-readable messages

/// Custom error types for the speech recognition protocol.
///
/// ## Usage Example:
/// ```rust
/// use remote_speech_backend::error::SrError;
/// let err = SrError::UnsupportedCodec("opus".to_string());
/// assert!(!err.is_connection_fatal());
/// ```
#[derive(Debug)]
pub enum SrError {
    /// The socket failed or the transport has been closed
    Connection(String),

    /// No envelope arrived within the deadline
    Timeout(String),

    /// The negotiated codec is not one we can decode
    UnsupportedCodec(String),

    /// A payload could not be interpreted
    Protocol(String),

    /// The recognition engine failed
    Engine(String),

    /// Configuration file or environment variable problems
    Config(String),

    /// The operation was cancelled by its caller
    Cancelled,
}

impl SrError {
    /// Whether this failure must end the session.
    ///
    /// Connection failures, timeouts and cancellation all mean the socket can
    /// no longer be trusted; callers proceed to teardown instead of retrying
    /// on the same socket.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            SrError::Connection(_) | SrError::Timeout(_) | SrError::Cancelled
        )
    }
}

impl fmt::Display for SrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SrError::Connection(msg) => write!(f, "Connection error: {}", msg),
            SrError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            SrError::UnsupportedCodec(codec) => write!(f, "Unsupported codec: {}", codec),
            SrError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SrError::Engine(msg) => write!(f, "Recognition engine error: {}", msg),
            SrError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SrError::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

impl std::error::Error for SrError {}

/// Socket read/write failures are always connection errors.
impl From<std::io::Error> for SrError {
    fn from(err: std::io::Error) -> Self {
        SrError::Connection(err.to_string())
    }
}

/// JSON only appears in `FINAL_RESULT` payloads, so a parse failure means
/// the peer sent something we cannot interpret.
impl From<serde_json::Error> for SrError {
    fn from(err: serde_json::Error) -> Self {
        SrError::Protocol(format!("JSON error: {}", err))
    }
}

impl From<std::str::Utf8Error> for SrError {
    fn from(err: std::str::Utf8Error) -> Self {
        SrError::Protocol(format!("payload is not valid UTF-8: {}", err))
    }
}

impl From<config::ConfigError> for SrError {
    fn from(err: config::ConfigError) -> Self {
        SrError::Config(err.to_string())
    }
}

/// Engines are free to use `anyhow` internally; whatever escapes them is an
/// engine failure.
impl From<anyhow::Error> for SrError {
    fn from(err: anyhow::Error) -> Self {
        SrError::Engine(err.to_string())
    }
}

/// Shorthand for `Result<T, SrError>`.
pub type SrResult<T> = Result<T, SrError>;
