//! # Recognition Results
//!
//! The value object a server session produces once and ships to the client
//! as the `FINAL_RESULT` payload.
//!
//! ## JSON shape:
//! Field names are PascalCase so that payloads stay compatible with
//! existing consumers of this protocol:
//!
//! ```json
//! {
//!   "RecognitionStatus": "Success",
//!   "RecognizedPhrases": [
//!     { "DisplayText": "Hello.", "LexicalForm": "hello", "Confidence": 0.9,
//!       "Locale": "en-US", "AudioTimeOffsetMs": 120, "AudioTimeLengthMs": 480 }
//!   ]
//! }
//! ```

use crate::error::SrResult;
use serde::{Deserialize, Serialize};

/// Terminal outcome of a recognition session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpeechRecognitionStatus {
    #[default]
    None,
    Success,
    NoMatch,
    InitialSilenceTimeout,
    BabbleTimeout,
    Error,
    Cancelled,
}

impl SpeechRecognitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeechRecognitionStatus::None => "none",
            SpeechRecognitionStatus::Success => "success",
            SpeechRecognitionStatus::NoMatch => "no_match",
            SpeechRecognitionStatus::InitialSilenceTimeout => "initial_silence_timeout",
            SpeechRecognitionStatus::BabbleTimeout => "babble_timeout",
            SpeechRecognitionStatus::Error => "error",
            SpeechRecognitionStatus::Cancelled => "cancelled",
        }
    }
}

/// One recognized phrase.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpeechRecognizedPhrase {
    pub display_text: String,
    pub lexical_form: String,
    /// 0.0 to 1.0
    pub confidence: f32,
    pub locale: String,
    pub audio_time_offset_ms: u64,
    pub audio_time_length_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpeechRecognitionResult {
    pub recognition_status: SpeechRecognitionStatus,
    #[serde(default)]
    pub recognized_phrases: Vec<SpeechRecognizedPhrase>,
}

impl SpeechRecognitionResult {
    pub fn new(status: SpeechRecognitionStatus) -> Self {
        Self {
            recognition_status: status,
            recognized_phrases: Vec::new(),
        }
    }

    /// The result every failure path on either end collapses into.
    pub fn error() -> Self {
        Self::new(SpeechRecognitionStatus::Error)
    }

    pub fn success(phrases: Vec<SpeechRecognizedPhrase>) -> Self {
        Self {
            recognition_status: SpeechRecognitionStatus::Success,
            recognized_phrases: phrases,
        }
    }

    pub fn is_success(&self) -> bool {
        self.recognition_status == SpeechRecognitionStatus::Success
    }

    /// Best phrase text, if any.
    pub fn text(&self) -> Option<&str> {
        self.recognized_phrases
            .first()
            .map(|phrase| phrase.display_text.as_str())
    }

    pub fn to_json(&self) -> SrResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> SrResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_uses_pascal_case() {
        let result = SpeechRecognitionResult::success(vec![SpeechRecognizedPhrase {
            display_text: "Hello.".to_string(),
            lexical_form: "hello".to_string(),
            confidence: 0.5,
            locale: "en-US".to_string(),
            audio_time_offset_ms: 120,
            audio_time_length_ms: 480,
        }]);

        let json = result.to_json().unwrap();
        assert!(json.contains("\"RecognitionStatus\":\"Success\""));
        assert!(json.contains("\"DisplayText\":\"Hello.\""));
        assert!(json.contains("\"AudioTimeOffsetMs\":120"));

        let parsed = SpeechRecognitionResult::from_json(&json).unwrap();
        assert_eq!(parsed, result);
        assert_eq!(parsed.text(), Some("Hello."));
    }

    #[test]
    fn test_missing_phrases_default_to_empty() {
        let parsed = SpeechRecognitionResult::from_json(r#"{"RecognitionStatus":"NoMatch"}"#).unwrap();
        assert_eq!(parsed.recognition_status, SpeechRecognitionStatus::NoMatch);
        assert!(parsed.recognized_phrases.is_empty());
        assert!(!parsed.is_success());

        assert!(SpeechRecognitionResult::from_json("not json").is_err());
    }
}
