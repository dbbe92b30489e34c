//! # Recognition Engine Interface
//!
//! The server session drives an engine through [`SpeechRecognizer`]; which
//! engine runs is decided by the [`RecognizerFactory`] handed to the server.
//!
//! ## Partial results:
//! Engines publish in-progress hypotheses through a [`PartialResultSink`].
//! Publishing only enqueues onto an unbounded channel; a relay task owned by
//! the session turns each entry into a `PARTIAL_RESULT` envelope. Engines
//! therefore never touch the socket and never block on it.
//!
//! ## Reference engine:
//! [`DiagnosticRecognizer`] measures voice activity by RMS energy. It is
//! what the server binary runs out of the box and what the tests exercise.

use crate::audio::format::{rms_energy, AudioSampleFormat};
use crate::error::{SrError, SrResult};
use crate::remoting::MessageId;
use crate::transcription::result::{
    SpeechRecognitionResult, SpeechRecognitionStatus, SpeechRecognizedPhrase,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A partial hypothesis tagged with the envelope that was being processed
/// when it was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResult {
    pub reply_to: MessageId,
    pub text: String,
}

/// Engine-side handle for publishing partial results.
///
/// The channel closes when every sink clone is dropped, which is how the
/// relay task learns the engine is gone.
#[derive(Debug, Clone)]
pub struct PartialResultSink {
    tx: mpsc::UnboundedSender<PartialResult>,
    trigger: Arc<AtomicU32>,
}

/// Session-side handle recording which envelope is being processed.
#[derive(Debug, Clone)]
pub struct PartialTrigger(Arc<AtomicU32>);

impl PartialTrigger {
    pub fn set(&self, id: MessageId) {
        self.0.store(id.0, Ordering::Release);
    }
}

impl PartialResultSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PartialResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            tx,
            trigger: Arc::new(AtomicU32::new(0)),
        };
        (sink, rx)
    }

    pub fn trigger(&self) -> PartialTrigger {
        PartialTrigger(self.trigger.clone())
    }

    /// Queue a partial result. Returns false if it was dropped.
    pub fn publish(&self, text: impl Into<String>) -> bool {
        let id = self.trigger.load(Ordering::Acquire);
        if id == 0 {
            tracing::debug!("partial result published before any audio; dropped");
            return false;
        }
        self.tx
            .send(PartialResult {
                reply_to: MessageId(id),
                text: text.into(),
            })
            .is_ok()
    }
}

/// One recognition stream.
#[async_trait]
pub trait SpeechRecognizer: Send {
    fn locale(&self) -> &str;

    /// Called once, when the decoder has determined the stream format.
    async fn begin_stream(
        &mut self,
        format: AudioSampleFormat,
        partials: PartialResultSink,
    ) -> SrResult<()>;

    /// Push decoded, interleaved samples.
    async fn feed(&mut self, samples: &[f32]) -> SrResult<()>;

    /// End of audio. Must also release the partial-result sink.
    async fn finish(&mut self) -> SrResult<SpeechRecognitionResult>;
}

/// Creates one recognizer per session.
#[async_trait]
pub trait RecognizerFactory: Send + Sync {
    async fn create(&self, locale: &str) -> SrResult<Box<dyn SpeechRecognizer>>;
}

/// Tuning for the diagnostic engine.
#[derive(Debug, Clone)]
pub struct DiagnosticConfig {
    /// RMS level above which a window counts as voiced
    pub voice_threshold: f32,
    /// Analysis window length
    pub window_ms: u32,
    /// A partial result is published every this much audio
    pub partial_interval_ms: u64,
}

impl Default for DiagnosticConfig {
    fn default() -> Self {
        Self {
            voice_threshold: 0.02,
            window_ms: 20,
            partial_interval_ms: 1000,
        }
    }
}

pub struct DiagnosticRecognizerFactory {
    config: DiagnosticConfig,
}

impl DiagnosticRecognizerFactory {
    pub fn new(config: DiagnosticConfig) -> Self {
        Self { config }
    }
}

impl Default for DiagnosticRecognizerFactory {
    fn default() -> Self {
        Self::new(DiagnosticConfig::default())
    }
}

#[async_trait]
impl RecognizerFactory for DiagnosticRecognizerFactory {
    async fn create(&self, locale: &str) -> SrResult<Box<dyn SpeechRecognizer>> {
        let locale = locale.trim();
        if locale.is_empty() {
            return Err(SrError::Protocol("START carried an empty locale".to_string()));
        }
        Ok(Box::new(DiagnosticRecognizer::new(
            locale.to_string(),
            self.config.clone(),
        )))
    }
}

/// Voice-activity "recognizer".
///
/// Reports how much of the stream was voiced rather than what was said.
pub struct DiagnosticRecognizer {
    locale: String,
    config: DiagnosticConfig,
    format: Option<AudioSampleFormat>,
    partials: Option<PartialResultSink>,
    pending: Vec<f32>,
    samples_seen: u64,
    voiced_windows: u64,
    first_voiced_ms: Option<u64>,
    last_voiced_end_ms: u64,
    next_partial_ms: u64,
}

impl DiagnosticRecognizer {
    pub fn new(locale: String, mut config: DiagnosticConfig) -> Self {
        config.partial_interval_ms = config.partial_interval_ms.max(1);
        config.window_ms = config.window_ms.max(1);
        let next_partial_ms = config.partial_interval_ms;
        Self {
            locale,
            config,
            format: None,
            partials: None,
            pending: Vec::new(),
            samples_seen: 0,
            voiced_windows: 0,
            first_voiced_ms: None,
            last_voiced_end_ms: 0,
            next_partial_ms,
        }
    }

    fn samples_to_ms(&self, samples: u64) -> u64 {
        match self.format {
            Some(format) if format.samples_per_second() > 0 => {
                samples * 1000 / format.samples_per_second() as u64
            }
            _ => 0,
        }
    }

    fn window_len(&self, format: AudioSampleFormat) -> usize {
        (format.samples_per_second() * self.config.window_ms as usize / 1000).max(1)
    }

    fn analyse_window(&mut self, window: &[f32]) {
        let start_ms = self.samples_to_ms(self.samples_seen);
        self.samples_seen += window.len() as u64;
        let end_ms = self.samples_to_ms(self.samples_seen);

        if rms_energy(window) >= self.config.voice_threshold {
            self.voiced_windows += 1;
            self.first_voiced_ms.get_or_insert(start_ms);
            self.last_voiced_end_ms = end_ms;
        }
    }

    fn voiced_ms(&self) -> u64 {
        self.voiced_windows * self.config.window_ms as u64
    }

    fn describe(&self) -> String {
        format!(
            "{:.1} seconds heard, {:.1} seconds voiced",
            self.samples_to_ms(self.samples_seen) as f64 / 1000.0,
            self.voiced_ms() as f64 / 1000.0
        )
    }

    /// Share of the heard audio that was voiced, mapped into [0.5, 1.0].
    fn estimate_confidence(&self) -> f32 {
        let heard = self.samples_to_ms(self.samples_seen);
        if heard == 0 {
            return 0.0;
        }
        let ratio = (self.voiced_ms() as f32 / heard as f32).clamp(0.0, 1.0);
        0.5 + ratio * 0.5
    }
}

#[async_trait]
impl SpeechRecognizer for DiagnosticRecognizer {
    fn locale(&self) -> &str {
        &self.locale
    }

    async fn begin_stream(
        &mut self,
        format: AudioSampleFormat,
        partials: PartialResultSink,
    ) -> SrResult<()> {
        if self.format.is_some() {
            return Err(SrError::Engine("stream already started".to_string()));
        }
        format.validate()?;
        tracing::debug!(locale = %self.locale, %format, "diagnostic recognizer stream started");
        self.format = Some(format);
        self.partials = Some(partials);
        Ok(())
    }

    async fn feed(&mut self, samples: &[f32]) -> SrResult<()> {
        let format = self
            .format
            .ok_or_else(|| SrError::Engine("audio fed before the stream started".to_string()))?;
        let window = self.window_len(format);

        self.pending.extend_from_slice(samples);
        let whole = self.pending.len() - self.pending.len() % window;
        let ready: Vec<f32> = self.pending.drain(..whole).collect();
        for chunk in ready.chunks(window) {
            self.analyse_window(chunk);
        }

        while self.samples_to_ms(self.samples_seen) >= self.next_partial_ms {
            self.next_partial_ms += self.config.partial_interval_ms;
            let text = self.describe();
            if let Some(sink) = &self.partials {
                sink.publish(text);
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> SrResult<SpeechRecognitionResult> {
        if !self.pending.is_empty() {
            let tail = std::mem::take(&mut self.pending);
            self.analyse_window(&tail);
        }
        self.partials = None;

        let Some(first_voiced_ms) = self.first_voiced_ms else {
            tracing::debug!(locale = %self.locale, "no voiced audio; reporting NoMatch");
            return Ok(SpeechRecognitionResult::new(SpeechRecognitionStatus::NoMatch));
        };

        let display_text = format!("Voice activity: {}.", self.describe());
        let lexical_form = display_text
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .collect();

        Ok(SpeechRecognitionResult::success(vec![SpeechRecognizedPhrase {
            display_text,
            lexical_form,
            confidence: self.estimate_confidence(),
            locale: self.locale.clone(),
            audio_time_offset_ms: first_voiced_ms,
            audio_time_length_ms: self.last_voiced_end_ms - first_voiced_ms,
        }]))
    }
}
