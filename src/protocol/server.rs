//! # Recognition Server
//!
//! One [`ServerSession`] per accepted connection drives the server side of
//! the protocol to completion and then tears itself down.
//!
//! ## Per-connection flow:
//! 1. Learn the mailbox id from the first envelope
//! 2. Receive with a per-message deadline and dispatch by message kind
//! 3. Buffer audio until enough bytes arrived to bind the decoder, then
//!    decode incrementally into the recognizer
//! 4. On final audio: drain, finish the recognizer, answer with `FINAL_RESULT`
//!
//! ## Partial results:
//! The recognizer publishes into a channel; a relay task owned by the
//! session sends each entry as `PARTIAL_RESULT`, correlated to the audio
//! envelope being processed when it was produced.
//!
//! ## Teardown order:
//! recognizer, then the relay task, then the transport, then the socket.
//! A failing session never takes the listener down.

use crate::audio::codec::{AudioDecoder, CodecRegistry};
use crate::audio::pipe::AudioPipe;
use crate::error::{SrError, SrResult};
use crate::protocol::SrMessageType;
use crate::remoting::{Envelope, MailboxId, MessageId, PostOffice, PostOfficeConfig};
use crate::state::AppState;
use crate::transcription::engine::{
    PartialResult, PartialResultSink, PartialTrigger, RecognizerFactory, SpeechRecognizer,
};
use crate::transcription::result::SpeechRecognitionResult;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// How long final audio waits for queued partial results to go out.
const RELAY_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything a session needs from the process around it.
#[derive(Clone)]
pub struct ServerContext {
    pub state: AppState,
    pub codecs: Arc<CodecRegistry>,
    pub recognizers: Arc<dyn RecognizerFactory>,
}

impl ServerContext {
    pub fn new(
        state: AppState,
        codecs: Arc<CodecRegistry>,
        recognizers: Arc<dyn RecognizerFactory>,
    ) -> Self {
        Self {
            state,
            codecs,
            recognizers,
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client sent `CLOSE_SOCKET`
    Closed,
    /// Timeout, transport failure, unsupported codec or a malformed message
    Failed(String),
}

/// What one session did, for counters and tests.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub mailbox: Option<MailboxId>,
    pub end: SessionEnd,
    pub decoder_created: bool,
    pub decoder_initializations: u32,
    /// Buffered byte count at the moment the decoder was bound
    pub initialized_at_bytes: Option<usize>,
    pub audio_bytes: usize,
    pub partial_results_sent: u32,
    pub final_results_sent: u32,
}

impl SessionReport {
    pub fn failed(&self) -> bool {
        matches!(self.end, SessionEnd::Failed(_))
    }
}

pub struct ServerSession {
    context: ServerContext,
    post_office: PostOffice,
    mailbox: Option<MailboxId>,
    start_received: bool,
    engine: Option<Box<dyn SpeechRecognizer>>,
    engine_error: Option<String>,
    decoder: Option<Box<dyn AudioDecoder>>,
    pipe: AudioPipe,
    buffered_bytes: usize,
    initialized: bool,
    finalized: bool,
    trigger: Option<PartialTrigger>,
    relay: Option<JoinHandle<u32>>,
    report: SessionReport,
}

impl ServerSession {
    /// Wrap an accepted connection. Socket options are the caller's business.
    pub fn new<S>(context: ServerContext, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let post_office =
            PostOffice::new(stream, PostOfficeConfig::server(&context.state.config.protocol));
        Self {
            context,
            post_office,
            mailbox: None,
            start_received: false,
            engine: None,
            engine_error: None,
            decoder: None,
            pipe: AudioPipe::new(),
            buffered_bytes: 0,
            initialized: false,
            finalized: false,
            trigger: None,
            relay: None,
            report: SessionReport {
                mailbox: None,
                end: SessionEnd::Closed,
                decoder_created: false,
                decoder_initializations: 0,
                initialized_at_bytes: None,
                audio_bytes: 0,
                partial_results_sent: 0,
                final_results_sent: 0,
            },
        }
    }

    /// Drive the session until it closes or fails, then tear it down.
    pub async fn run(mut self, shutdown: CancellationToken) -> SessionReport {
        if let Err(e) = self.drive(&shutdown).await {
            if matches!(e, SrError::Cancelled) {
                info!("session interrupted by shutdown");
            } else {
                warn!("session abandoned: {}", e);
            }
            self.report.end = SessionEnd::Failed(e.to_string());
        }
        self.teardown().await;
        self.report
    }

    async fn drive(&mut self, shutdown: &CancellationToken) -> SrResult<()> {
        let receive_timeout = self.context.state.config.protocol.receive_timeout();

        let mailbox = self
            .post_office
            .wait_for_new_mailbox(shutdown, receive_timeout)
            .await?;
        self.mailbox = Some(mailbox);
        self.report.mailbox = Some(mailbox);
        debug!(%mailbox, "session mailbox opened");

        loop {
            let envelope = self
                .post_office
                .try_receive(mailbox, shutdown, receive_timeout)
                .await?
                .ok_or_else(|| {
                    SrError::Timeout(format!("no message within {:?}", receive_timeout))
                })?;

            match SrMessageType::from_protocol_id(envelope.protocol_id) {
                Some(SrMessageType::CloseSocket) => {
                    debug!(%mailbox, "client closed the session");
                    return Ok(());
                }
                Some(SrMessageType::Start) => self.on_start(&envelope).await?,
                Some(SrMessageType::SendAudioHeader) => self.on_audio_header(&envelope)?,
                Some(SrMessageType::SendAudio) => self.on_audio(&envelope, shutdown).await?,
                Some(SrMessageType::SendFinalAudio) => {
                    self.on_final_audio(&envelope, shutdown).await?
                }
                _ => warn!(
                    protocol_id = envelope.protocol_id,
                    "ignoring message kind the server does not handle"
                ),
            }
        }
    }

    async fn on_start(&mut self, envelope: &Envelope) -> SrResult<()> {
        let locale = envelope.payload_str()?.trim().to_string();
        if self.start_received {
            warn!(%locale, "duplicate START ignored");
            return Ok(());
        }
        self.start_received = true;

        match self.context.recognizers.create(&locale).await {
            Ok(engine) => {
                info!(%locale, "recognizer created");
                self.engine = Some(engine);
            }
            Err(e) => {
                // Reported to the client as an Error result at finalize time
                error!(%locale, "could not create recognizer: {}", e);
                self.engine_error = Some(e.to_string());
            }
        }
        Ok(())
    }

    fn on_audio_header(&mut self, envelope: &Envelope) -> SrResult<()> {
        let header = envelope.payload_str()?;
        if self.decoder.is_some() {
            warn!(%header, "duplicate audio header ignored");
            return Ok(());
        }

        let decoder = self.context.codecs.create_decoder_from_header(header)?;
        info!(%header, codec = %decoder.codec(), "audio decoder created");
        self.decoder = Some(decoder);
        self.report.decoder_created = true;
        Ok(())
    }

    fn buffer_audio(&mut self, payload: &Bytes) {
        self.pipe.write(payload);
        self.buffered_bytes += payload.len();
        self.report.audio_bytes += payload.len();
        self.context.state.audio_received(payload.len());
    }

    /// Bytes to buffer before binding the decoder. The configured value is a
    /// floor; a container codec may need more to find its header.
    fn header_threshold(&self) -> usize {
        let required = self
            .decoder
            .as_ref()
            .map(|decoder| decoder.header_bytes_required())
            .unwrap_or(0);
        self.context
            .state
            .config
            .protocol
            .header_buffer_bytes
            .max(required)
    }

    async fn on_audio(&mut self, envelope: &Envelope, shutdown: &CancellationToken) -> SrResult<()> {
        if self.finalized {
            warn!("audio after final audio ignored");
            return Ok(());
        }
        self.buffer_audio(&envelope.payload);

        if !self.initialized {
            if self.decoder.is_none() {
                debug!(bytes = self.buffered_bytes, "audio before header; buffering");
                return Ok(());
            }
            if self.buffered_bytes < self.header_threshold() {
                return Ok(());
            }
            if !self.initialize(envelope.message_id, shutdown).await? {
                return Ok(());
            }
        }

        self.pump(envelope.message_id).await
    }

    /// Bind the decoder to the pipe and start the recognizer stream.
    ///
    /// Returns false while the decoder still needs more header bytes. Once the
    /// pipe is closed an incomplete header is an error.
    async fn initialize(
        &mut self,
        trigger_id: MessageId,
        shutdown: &CancellationToken,
    ) -> SrResult<bool> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| SrError::Protocol("audio decoder not negotiated".to_string()))?;

        let Some(format) = decoder.initialize(&mut self.pipe)? else {
            if self.pipe.is_closed() {
                return Err(SrError::Protocol(format!(
                    "incomplete {} header in {} buffered bytes",
                    decoder.codec(),
                    self.buffered_bytes
                )));
            }
            debug!(buffered = self.buffered_bytes, "decoder needs more header bytes");
            return Ok(false);
        };
        self.initialized = true;
        self.report.decoder_initializations += 1;
        self.report.initialized_at_bytes = Some(self.buffered_bytes);
        info!(%format, buffered = self.buffered_bytes, "audio decoder initialized");

        let (Some(engine), Some(mailbox)) = (self.engine.as_mut(), self.mailbox) else {
            return Ok(true);
        };

        let (sink, partials) = PartialResultSink::channel();
        let trigger = sink.trigger();
        trigger.set(trigger_id);

        if let Err(e) = engine.begin_stream(format, sink).await {
            error!("recognizer refused the stream: {}", e);
            self.engine_error = Some(e.to_string());
            self.engine = None;
            return Ok(true);
        }

        self.trigger = Some(trigger);
        self.relay = Some(tokio::spawn(
            relay_partials(self.post_office.clone(), mailbox, partials, shutdown.clone())
                .in_current_span(),
        ));
        Ok(true)
    }

    /// Decode what is available and feed it to the recognizer.
    async fn pump(&mut self, trigger_id: MessageId) -> SrResult<()> {
        if !self.initialized {
            return Ok(());
        }
        if let Some(trigger) = &self.trigger {
            trigger.set(trigger_id);
        }

        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(());
        };
        let samples = decoder.decode(&mut self.pipe)?;
        if samples.is_empty() {
            return Ok(());
        }

        if let Some(engine) = self.engine.as_mut() {
            if let Err(e) = engine.feed(&samples).await {
                error!("recognizer failed while streaming: {}", e);
                self.engine_error = Some(e.to_string());
                self.engine = None;
            }
        }
        Ok(())
    }

    async fn on_final_audio(
        &mut self,
        envelope: &Envelope,
        shutdown: &CancellationToken,
    ) -> SrResult<()> {
        if self.finalized {
            warn!("duplicate final audio ignored");
            return Ok(());
        }
        self.finalized = true;

        if !envelope.payload.is_empty() {
            self.buffer_audio(&envelope.payload);
        }
        self.pipe.close();

        // Short streams never reached the threshold; bind now
        let drained = async {
            if !self.initialized && self.decoder.is_some() {
                self.initialize(envelope.message_id, shutdown).await?;
            }
            self.pump(envelope.message_id).await
        }
        .await;
        if let Err(e) = drained {
            warn!("could not drain audio at finalize: {}", e);
            self.engine_error.get_or_insert(e.to_string());
        }

        let result = self.finish_recognizer().await;

        // The sink went with the recognizer; flush partials so they precede the final result
        self.engine = None;
        self.flush_relay().await;

        let mailbox = self
            .mailbox
            .ok_or_else(|| SrError::Protocol("final audio before mailbox".to_string()))?;
        let reply = Envelope::reply(
            mailbox,
            SrMessageType::FinalResult.protocol_id(),
            Bytes::from(result.to_json()?),
            self.post_office.generate_message_id(),
            envelope.message_id,
        );
        self.post_office.send(reply, shutdown).await?;

        self.report.final_results_sent += 1;
        self.context.state.final_result_sent();
        info!(
            status = result.recognition_status.as_str(),
            audio_bytes = self.report.audio_bytes,
            "final result sent"
        );
        Ok(())
    }

    async fn finish_recognizer(&mut self) -> SpeechRecognitionResult {
        if let Some(reason) = &self.engine_error {
            debug!(%reason, "reporting recognizer failure");
            return SpeechRecognitionResult::error();
        }

        let Some(engine) = self.engine.as_mut() else {
            warn!("final audio without START; reporting error");
            return SpeechRecognitionResult::error();
        };

        match engine.finish().await {
            Ok(result) => result,
            Err(e) => {
                error!("recognizer failed to finish: {}", e);
                SpeechRecognitionResult::error()
            }
        }
    }

    /// Wait for queued partials to go out. A sink clone that outlives the
    /// recognizer would keep the relay alive forever, so the wait is bounded.
    async fn flush_relay(&mut self) {
        let Some(mut relay) = self.relay.take() else {
            return;
        };
        match tokio::time::timeout(RELAY_FLUSH_TIMEOUT, &mut relay).await {
            Ok(Ok(sent)) => self.report.partial_results_sent += sent,
            Ok(Err(e)) => warn!("partial result relay panicked: {}", e),
            Err(_) => {
                warn!("partial result sink outlived the recognizer; stopping relay");
                relay.abort();
            }
        }
    }

    async fn teardown(&mut self) {
        self.engine = None;
        self.decoder = None;
        self.trigger = None;
        self.flush_relay().await;
        self.post_office.close();
        debug!(mailbox = ?self.mailbox, "session torn down");
    }
}

/// Send partial results as they are published, until the recognizer drops
/// its sink, the transport closes or the session is cancelled.
async fn relay_partials(
    post_office: PostOffice,
    mailbox: MailboxId,
    mut partials: mpsc::UnboundedReceiver<PartialResult>,
    cancel: CancellationToken,
) -> u32 {
    let mut sent = 0;
    loop {
        let next = tokio::select! {
            biased;
            partial = partials.recv() => partial,
            _ = post_office.closed() => None,
            _ = cancel.cancelled() => None,
        };
        let Some(partial) = next else {
            break;
        };
        let envelope = Envelope::reply(
            mailbox,
            SrMessageType::PartialResult.protocol_id(),
            Bytes::from(partial.text),
            post_office.generate_message_id(),
            partial.reply_to,
        );
        if let Err(e) = post_office.send(envelope, &cancel).await {
            debug!("partial relay stopped: {}", e);
            break;
        }
        sent += 1;
    }
    sent
}

fn tune_socket(socket: &TcpStream) -> SrResult<()> {
    socket.set_nodelay(true)?;
    #[allow(deprecated)]
    socket.set_linger(Some(Duration::ZERO))?;
    Ok(())
}

/// Accept connections until `shutdown` fires, one session task per connection.
///
/// At most `server.max_connections` sessions run at once; further clients
/// wait in the listen backlog. Returns after every session has finished.
pub async fn serve(
    listener: TcpListener,
    context: ServerContext,
    shutdown: CancellationToken,
) -> SrResult<()> {
    let limit = Arc::new(Semaphore::new(context.state.config.server.max_connections));
    let sessions = TaskTracker::new();

    if let Ok(address) = listener.local_addr() {
        info!(%address, "accepting recognition sessions");
    }

    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = limit.clone().acquire_owned() => permit
                .map_err(|_| SrError::Connection("connection limiter closed".to_string()))?,
        };

        let (socket, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            },
        };

        if let Err(e) = tune_socket(&socket) {
            warn!(%peer, "could not set socket options: {}", e);
        }

        let connection_id = Uuid::new_v4();
        let span = info_span!("connection", %connection_id, %peer);
        let context = context.clone();
        let session_shutdown = shutdown.child_token();

        sessions.spawn(
            async move {
                let _permit = permit;
                let state = context.state.clone();
                state.session_started();
                info!("connection accepted");

                let report = ServerSession::new(context, socket).run(session_shutdown).await;

                state.session_finished(report.failed());
                info!(
                    failed = report.failed(),
                    audio_bytes = report.audio_bytes,
                    partials = report.partial_results_sent,
                    "connection closed"
                );
            }
            .instrument(span),
        );
    }

    sessions.close();
    info!(remaining = sessions.len(), "waiting for open sessions to finish");
    sessions.wait().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::{float_to_pcm, AudioSampleFormat};
    use crate::config::{AppConfig, ClientConfig};
    use crate::protocol::client::RemoteSpeechRecognizer;
    use crate::transcription::engine::DiagnosticRecognizerFactory;
    use crate::audio::codec::wav_header;
    use crate::transcription::result::SpeechRecognitionStatus;
    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    const WAIT: Duration = Duration::from_secs(2);

    fn context_with(config: AppConfig) -> ServerContext {
        ServerContext::new(
            AppState::new(config),
            Arc::new(CodecRegistry::new()),
            Arc::new(DiagnosticRecognizerFactory::default()),
        )
    }

    fn context() -> ServerContext {
        context_with(AppConfig::default())
    }

    /// A scripted client on one end of an in-memory pipe, a session on the other.
    struct Harness {
        office: PostOffice,
        mailbox: MailboxId,
        cancel: CancellationToken,
        session: JoinHandle<SessionReport>,
    }

    impl Harness {
        fn new(context: ServerContext) -> Self {
            let (client_io, server_io): (DuplexStream, DuplexStream) = tokio::io::duplex(1 << 20);
            let session = tokio::spawn(ServerSession::new(context, server_io).run(CancellationToken::new()));
            let office = PostOffice::new(client_io, PostOfficeConfig::client(Duration::from_secs(30)));
            let mailbox = office.create_mailbox();
            Self {
                office,
                mailbox,
                cancel: CancellationToken::new(),
                session,
            }
        }

        async fn send(&self, kind: SrMessageType, payload: impl Into<Bytes>) -> MessageId {
            self.send_raw(kind.protocol_id(), payload).await
        }

        async fn send_raw(&self, protocol_id: u16, payload: impl Into<Bytes>) -> MessageId {
            let id = self.office.generate_message_id();
            let envelope = Envelope::new(self.mailbox, protocol_id, payload, id);
            self.office.send(envelope, &self.cancel).await.unwrap();
            id
        }

        /// Everything the server sent until it hung up.
        async fn collect_replies(&self) -> Vec<Envelope> {
            let mut replies = Vec::new();
            while let Ok(Some(envelope)) = self.office.try_receive(self.mailbox, &self.cancel, WAIT).await {
                replies.push(envelope);
            }
            replies
        }

        async fn finish(self) -> (Vec<Envelope>, SessionReport) {
            let replies = self.collect_replies().await;
            let report = self.session.await.unwrap();
            (replies, report)
        }
    }

    fn pcm_tone(seconds: f32) -> Vec<u8> {
        let n = (16_000.0 * seconds) as usize;
        let samples: Vec<f32> = (0..n)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / 16_000.0).sin() * 0.3)
            .collect();
        float_to_pcm(&samples)
            .into_iter()
            .flat_map(|s| s.to_le_bytes())
            .collect()
    }

    fn final_results(replies: &[Envelope]) -> Vec<&Envelope> {
        replies
            .iter()
            .filter(|e| e.protocol_id == SrMessageType::FinalResult.protocol_id())
            .collect()
    }

    #[tokio::test]
    async fn test_start_then_close_never_creates_decoder() {
        let harness = Harness::new(context());
        harness.send(SrMessageType::Start, "en-US").await;
        harness.send(SrMessageType::CloseSocket, Bytes::new()).await;

        let (replies, report) = harness.finish().await;
        assert!(replies.is_empty());
        assert_eq!(report.end, SessionEnd::Closed);
        assert!(!report.decoder_created);
        assert_eq!(report.decoder_initializations, 0);
    }

    #[tokio::test]
    async fn test_full_exchange_yields_one_final_result() {
        let harness = Harness::new(context());
        harness.send(SrMessageType::Start, "en-US").await;
        harness.send(SrMessageType::SendAudioHeader, "pcm|16000").await;
        harness.send(SrMessageType::SendAudio, vec![0u8; 1000]).await;
        let final_id = harness.send(SrMessageType::SendFinalAudio, Bytes::new()).await;
        harness.send(SrMessageType::CloseSocket, Bytes::new()).await;

        let (replies, report) = harness.finish().await;
        let finals = final_results(&replies);
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].reply_to, Some(final_id));

        let json: serde_json::Value = serde_json::from_str(finals[0].payload_str().unwrap()).unwrap();
        assert!(json.get("RecognitionStatus").is_some());

        assert_eq!(report.end, SessionEnd::Closed);
        assert_eq!(report.decoder_initializations, 1);
        assert_eq!(report.audio_bytes, 1000);
        assert_eq!(report.final_results_sent, 1);
    }

    #[tokio::test]
    async fn test_unsupported_codec_abandons_session() {
        let harness = Harness::new(context());
        harness.send(SrMessageType::Start, "en-US").await;
        harness.send(SrMessageType::SendAudioHeader, "opus|48000").await;

        let (replies, report) = harness.finish().await;
        assert!(replies.is_empty());
        assert!(report.failed());
        assert!(!report.decoder_created);
    }

    #[tokio::test]
    async fn test_decoder_binds_once_after_threshold() {
        let harness = Harness::new(context());
        harness.send(SrMessageType::Start, "en-US").await;
        harness.send(SrMessageType::SendAudioHeader, "pcm|16000").await;
        for _ in 0..5 {
            harness.send(SrMessageType::SendAudio, vec![0u8; 250]).await;
        }
        harness.send(SrMessageType::SendFinalAudio, Bytes::new()).await;
        harness.send(SrMessageType::CloseSocket, Bytes::new()).await;

        let (_, report) = harness.finish().await;
        assert_eq!(report.decoder_initializations, 1);
        assert_eq!(report.initialized_at_bytes, Some(750));
    }

    #[tokio::test]
    async fn test_short_stream_binds_decoder_at_finalize() {
        let harness = Harness::new(context());
        harness.send(SrMessageType::Start, "en-US").await;
        harness.send(SrMessageType::SendAudioHeader, "pcm|16000").await;
        harness.send(SrMessageType::SendAudio, vec![0u8; 100]).await;
        harness.send(SrMessageType::SendFinalAudio, vec![0u8; 20]).await;
        harness.send(SrMessageType::CloseSocket, Bytes::new()).await;

        let (replies, report) = harness.finish().await;
        assert_eq!(final_results(&replies).len(), 1);
        assert_eq!(report.decoder_initializations, 1);
        assert_eq!(report.initialized_at_bytes, Some(120));
    }

    #[tokio::test]
    async fn test_codec_can_raise_threshold() {
        let mut config = AppConfig::default();
        config.protocol.header_buffer_bytes = 10;
        let harness = Harness::new(context_with(config));

        let mut encoder = CodecRegistry::new()
            .create_encoder("wav", AudioSampleFormat::speech())
            .unwrap();
        let stream = encoder.encode(&vec![0.25f32; 400]);

        harness.send(SrMessageType::Start, "en-US").await;
        harness.send(SrMessageType::SendAudioHeader, "wav|").await;
        for chunk in stream.chunks(20) {
            harness.send(SrMessageType::SendAudio, Bytes::copy_from_slice(chunk)).await;
        }
        harness.send(SrMessageType::SendFinalAudio, Bytes::new()).await;
        harness.send(SrMessageType::CloseSocket, Bytes::new()).await;

        let (replies, report) = harness.finish().await;
        // 44-byte RIFF header needs three 20-byte chunks, not one
        assert_eq!(report.initialized_at_bytes, Some(60));
        assert_eq!(final_results(&replies).len(), 1);
    }

    async fn recognize_in_chunks(audio: &[u8], chunk: usize) -> (SpeechRecognitionResult, SessionReport) {
        let harness = Harness::new(context());
        harness.send(SrMessageType::Start, "en-US").await;
        harness.send(SrMessageType::SendAudioHeader, "pcm|16000").await;
        for piece in audio.chunks(chunk) {
            harness.send(SrMessageType::SendAudio, Bytes::copy_from_slice(piece)).await;
        }
        harness.send(SrMessageType::SendFinalAudio, Bytes::new()).await;
        harness.send(SrMessageType::CloseSocket, Bytes::new()).await;

        let (replies, report) = harness.finish().await;
        let finals = final_results(&replies);
        assert_eq!(finals.len(), 1);
        let result = SpeechRecognitionResult::from_json(finals[0].payload_str().unwrap()).unwrap();
        (result, report)
    }

    #[tokio::test]
    async fn test_result_does_not_depend_on_chunking() {
        let audio = pcm_tone(1.5);
        let (whole, whole_report) = recognize_in_chunks(&audio, audio.len()).await;
        let (odd, odd_report) = recognize_in_chunks(&audio, 777).await;
        let (tiny, _) = recognize_in_chunks(&audio, 3001).await;

        assert!(whole.is_success());
        assert_eq!(whole, odd);
        assert_eq!(whole, tiny);
        assert_eq!(whole_report.audio_bytes, audio.len());
        assert_eq!(odd_report.audio_bytes, audio.len());
    }

    #[tokio::test]
    async fn test_partials_reply_to_audio_envelopes() {
        let harness = Harness::new(context());
        harness.send(SrMessageType::Start, "en-US").await;
        harness.send(SrMessageType::SendAudioHeader, "pcm|16000").await;

        let audio = pcm_tone(2.5);
        let mut audio_ids = Vec::new();
        for piece in audio.chunks(8000) {
            audio_ids.push(harness.send(SrMessageType::SendAudio, Bytes::copy_from_slice(piece)).await);
        }
        audio_ids.push(harness.send(SrMessageType::SendFinalAudio, Bytes::new()).await);
        harness.send(SrMessageType::CloseSocket, Bytes::new()).await;

        let (replies, report) = harness.finish().await;
        let partials: Vec<&Envelope> = replies
            .iter()
            .filter(|e| e.protocol_id == SrMessageType::PartialResult.protocol_id())
            .collect();

        assert_eq!(partials.len(), 2);
        assert_eq!(report.partial_results_sent, 2);
        for partial in &partials {
            let reply_to = partial.reply_to.unwrap();
            assert!(audio_ids.contains(&reply_to), "{} is not an audio envelope", reply_to);
        }

        // Partials are flushed ahead of the final result
        let last = replies.last().unwrap();
        assert_eq!(last.protocol_id, SrMessageType::FinalResult.protocol_id());
    }

    /// WAV stream with a LIST chunk between `fmt ` and `data`.
    fn wav_with_list_chunk(list_len: usize, samples: usize) -> Vec<u8> {
        let canonical = wav_header(AudioSampleFormat::speech());
        let mut stream = canonical[..36].to_vec();
        stream.extend_from_slice(b"LIST");
        stream.extend_from_slice(&(list_len as u32).to_le_bytes());
        stream.extend(std::iter::repeat(b'x').take(list_len));
        stream.extend_from_slice(&canonical[36..]);
        stream.extend(pcm_tone(samples as f32 / 16_000.0));
        stream
    }

    #[tokio::test]
    async fn test_wav_header_longer_than_threshold_keeps_buffering() {
        let harness = Harness::new(context());
        let stream = wav_with_list_chunk(700, 16_000);

        harness.send(SrMessageType::Start, "en-US").await;
        harness.send(SrMessageType::SendAudioHeader, "wav|").await;
        for chunk in stream.chunks(320) {
            harness.send(SrMessageType::SendAudio, Bytes::copy_from_slice(chunk)).await;
        }
        harness.send(SrMessageType::SendFinalAudio, Bytes::new()).await;
        harness.send(SrMessageType::CloseSocket, Bytes::new()).await;

        let (replies, report) = harness.finish().await;
        assert_eq!(report.end, SessionEnd::Closed);
        assert_eq!(report.decoder_initializations, 1);
        // 36 + 8 + 700 + 8 header bytes arrive with the third 320-byte chunk
        assert_eq!(report.initialized_at_bytes, Some(960));

        let finals = final_results(&replies);
        assert_eq!(finals.len(), 1);
        let result = SpeechRecognitionResult::from_json(finals[0].payload_str().unwrap()).unwrap();
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_incomplete_wav_header_at_final_audio_is_error_result() {
        let harness = Harness::new(context());
        let stream = wav_with_list_chunk(2000, 0);

        harness.send(SrMessageType::Start, "en-US").await;
        harness.send(SrMessageType::SendAudioHeader, "wav|").await;
        harness.send(SrMessageType::SendAudio, Bytes::copy_from_slice(&stream[..1000])).await;
        harness.send(SrMessageType::SendFinalAudio, Bytes::new()).await;
        harness.send(SrMessageType::CloseSocket, Bytes::new()).await;

        let (replies, report) = harness.finish().await;
        assert_eq!(report.end, SessionEnd::Closed);
        assert_eq!(report.decoder_initializations, 0);

        let finals = final_results(&replies);
        assert_eq!(finals.len(), 1);
        let result = SpeechRecognitionResult::from_json(finals[0].payload_str().unwrap()).unwrap();
        assert_eq!(result.recognition_status, SpeechRecognitionStatus::Error);
    }

    /// Hands a sink clone to a worker that never finishes.
    struct SinkHoardingRecognizer;

    #[async_trait]
    impl SpeechRecognizer for SinkHoardingRecognizer {
        fn locale(&self) -> &str {
            "en-US"
        }

        async fn begin_stream(
            &mut self,
            _format: AudioSampleFormat,
            partials: PartialResultSink,
        ) -> SrResult<()> {
            let worker_sink = partials.clone();
            tokio::spawn(async move {
                let _sink = worker_sink;
                std::future::pending::<()>().await;
            });
            Ok(())
        }

        async fn feed(&mut self, _samples: &[f32]) -> SrResult<()> {
            Ok(())
        }

        async fn finish(&mut self) -> SrResult<SpeechRecognitionResult> {
            Ok(SpeechRecognitionResult::new(SpeechRecognitionStatus::NoMatch))
        }
    }

    struct SinkHoardingFactory;

    #[async_trait]
    impl RecognizerFactory for SinkHoardingFactory {
        async fn create(&self, _locale: &str) -> SrResult<Box<dyn SpeechRecognizer>> {
            Ok(Box::new(SinkHoardingRecognizer))
        }
    }

    #[tokio::test]
    async fn test_leaked_partial_sink_does_not_block_final_result() {
        let context = ServerContext::new(
            AppState::new(AppConfig::default()),
            Arc::new(CodecRegistry::new()),
            Arc::new(SinkHoardingFactory),
        );
        let harness = Harness::new(context);
        harness.send(SrMessageType::Start, "en-US").await;
        harness.send(SrMessageType::SendAudioHeader, "pcm|16000").await;
        harness.send(SrMessageType::SendAudio, vec![0u8; 1000]).await;
        harness.send(SrMessageType::SendFinalAudio, Bytes::new()).await;
        harness.send(SrMessageType::CloseSocket, Bytes::new()).await;

        let (replies, report) = tokio::time::timeout(Duration::from_secs(5), harness.finish())
            .await
            .expect("session should end despite the leaked sink");
        assert_eq!(final_results(&replies).len(), 1);
        assert_eq!(report.end, SessionEnd::Closed);
    }

    #[tokio::test]
    async fn test_relay_stops_when_transport_closes() {
        let (office_io, _peer) = tokio::io::duplex(1024);
        let office = PostOffice::new(office_io, PostOfficeConfig::client(Duration::from_secs(30)));
        let (sink, partials) = PartialResultSink::channel();
        let relay = tokio::spawn(relay_partials(
            office.clone(),
            MailboxId(1),
            partials,
            CancellationToken::new(),
        ));

        office.close();
        let sent = tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .expect("relay should stop once the transport closes")
            .unwrap();
        assert_eq!(sent, 0);
        drop(sink);
    }

    #[tokio::test]
    async fn test_final_audio_without_start_is_error_result() {
        let harness = Harness::new(context());
        harness.send(SrMessageType::SendAudioHeader, "pcm|16000").await;
        harness.send(SrMessageType::SendAudio, vec![0u8; 800]).await;
        harness.send(SrMessageType::SendFinalAudio, Bytes::new()).await;
        harness.send(SrMessageType::CloseSocket, Bytes::new()).await;

        let (replies, report) = harness.finish().await;
        let finals = final_results(&replies);
        let result = SpeechRecognitionResult::from_json(finals[0].payload_str().unwrap()).unwrap();
        assert_eq!(result.recognition_status, SpeechRecognitionStatus::Error);
        assert_eq!(report.end, SessionEnd::Closed);
    }

    #[tokio::test]
    async fn test_unknown_kinds_are_ignored() {
        let harness = Harness::new(context());
        harness.send(SrMessageType::Start, "en-US").await;
        harness.send_raw(42, "from the future").await;
        harness.send(SrMessageType::SendFinalAudio, Bytes::new()).await;
        harness.send(SrMessageType::CloseSocket, Bytes::new()).await;

        let (replies, report) = harness.finish().await;
        assert_eq!(final_results(&replies).len(), 1);
        assert_eq!(report.end, SessionEnd::Closed);
        // No header: the recognizer reports on zero audio
        let result = SpeechRecognitionResult::from_json(replies[0].payload_str().unwrap()).unwrap();
        assert_eq!(result.recognition_status, SpeechRecognitionStatus::NoMatch);
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let mut config = AppConfig::default();
        config.protocol.receive_timeout_ms = 100;
        let harness = Harness::new(context_with(config));
        harness.send(SrMessageType::Start, "en-US").await;

        let report = harness.session.await.unwrap();
        assert!(report.failed());
        assert!(matches!(report.end, SessionEnd::Failed(ref reason) if reason.contains("Timed out")));
    }

    #[tokio::test]
    async fn test_concurrent_sessions_over_tcp_are_isolated() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let context = context();
        let state = context.state.clone();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, context, shutdown.clone()));

        let client_config = ClientConfig {
            remote_port: port,
            ..ClientConfig::default()
        };
        let codecs = Arc::new(CodecRegistry::new());

        let run = |locale: &'static str, seconds: f32, codec: &'static str| {
            let mut config = client_config.clone();
            config.codec = codec.to_string();
            let codecs = codecs.clone();
            async move {
                let mut client = RemoteSpeechRecognizer::new(config, codecs);
                let cancel = CancellationToken::new();
                assert!(client.start(locale, AudioSampleFormat::speech(), &cancel).await);
                let n = (16_000.0 * seconds) as usize;
                let samples: Vec<f32> = (0..n).map(|i| (i as f32 * 0.07).sin() * 0.3).collect();
                for chunk in samples.chunks(1600) {
                    client.write(chunk, &cancel).await.unwrap();
                }
                let result = client.finish(&cancel).await;
                client.dispose();
                result
            }
        };

        let (first, second) = futures_util::future::join(
            run("en-US", 1.0, "pcm"),
            run("fr-FR", 2.0, "ulaw"),
        )
        .await;

        assert!(first.is_success());
        assert!(second.is_success());
        assert_eq!(first.recognized_phrases[0].locale, "en-US");
        assert_eq!(second.recognized_phrases[0].locale, "fr-FR");
        assert!(second.recognized_phrases[0].audio_time_length_ms > first.recognized_phrases[0].audio_time_length_ms);

        shutdown.cancel();
        server.await.unwrap().unwrap();

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.total_sessions, 2);
        assert_eq!(metrics.active_sessions, 0);
        assert_eq!(metrics.final_results_sent, 2);
    }
}
