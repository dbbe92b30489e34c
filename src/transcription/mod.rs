//! # Transcription Module
//!
//! What the server does with decoded audio.
//!
//! ## Key Components:
//! - **Result model**: `SpeechRecognitionResult`, serialized as the `FINAL_RESULT` payload
//! - **Engine interface**: `SpeechRecognizer` / `RecognizerFactory`, plus the
//!   partial-result sink engines publish through
//! - **Diagnostic engine**: an energy-based reference recognizer

pub mod engine;
pub mod result;

pub use engine::{
    DiagnosticConfig, DiagnosticRecognizer, DiagnosticRecognizerFactory, PartialResult,
    PartialResultSink, PartialTrigger, RecognizerFactory, SpeechRecognizer,
};
pub use result::{SpeechRecognitionResult, SpeechRecognitionStatus, SpeechRecognizedPhrase};
