//! # Remote Speech Recognizer (client)
//!
//! Streams local audio to a recognition server and returns its result.
//!
//! ## Session flow:
//! 1. `start`: connect, open a mailbox, send `START(locale)`; no acknowledgement is awaited
//! 2. `write`: the first call sends `SEND_AUDIO_HEADER`, every call with encoded
//!    output sends `SEND_AUDIO`, then polls once (zero timeout) for a partial result
//! 3. `finish`: send `SEND_FINAL_AUDIO` and `CLOSE_SOCKET`, then poll until
//!    `FINAL_RESULT` or the read timeout
//! 4. `dispose`: close the transport and drop the socket without lingering
//!
//! ## Failure policy:
//! Nothing is retried here. `finish` never returns an error: every failure
//! path collapses into a result with `SpeechRecognitionStatus::Error`.

use crate::audio::codec::{AudioEncoder, CodecRegistry};
use crate::audio::format::AudioSampleFormat;
use crate::config::ClientConfig;
use crate::error::{SrError, SrResult};
use crate::protocol::session::ClientSessionState;
use crate::protocol::SrMessageType;
use crate::remoting::{Envelope, MailboxId, PostOffice, PostOfficeConfig};
use crate::transcription::result::SpeechRecognitionResult;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Idle sleep between empty polls while waiting for the final result.
const FINAL_POLL_INTERVAL: Duration = Duration::from_millis(5);

struct Connection {
    post_office: PostOffice,
    mailbox: MailboxId,
    encoder: Box<dyn AudioEncoder>,
}

impl Connection {
    async fn send(
        &self,
        kind: SrMessageType,
        payload: impl Into<Bytes>,
        cancel: &CancellationToken,
    ) -> SrResult<()> {
        let envelope = Envelope::new(
            self.mailbox,
            kind.protocol_id(),
            payload,
            self.post_office.generate_message_id(),
        );
        self.post_office.send(envelope, cancel).await
    }
}

pub struct RemoteSpeechRecognizer {
    config: ClientConfig,
    codecs: Arc<CodecRegistry>,
    connection: Option<Connection>,
    state: ClientSessionState,
    partial_tx: mpsc::UnboundedSender<String>,
    partial_rx: Option<mpsc::UnboundedReceiver<String>>,
}

impl RemoteSpeechRecognizer {
    pub fn new(config: ClientConfig, codecs: Arc<CodecRegistry>) -> Self {
        let (partial_tx, partial_rx) = mpsc::unbounded_channel();
        Self {
            config,
            codecs,
            connection: None,
            state: ClientSessionState::NotStarted,
            partial_tx,
            partial_rx: Some(partial_rx),
        }
    }

    pub fn state(&self) -> ClientSessionState {
        self.state
    }

    /// Partial results as they arrive. Can be taken once.
    pub fn partial_results(&mut self) -> Option<UnboundedReceiverStream<String>> {
        self.partial_rx.take().map(UnboundedReceiverStream::new)
    }

    /// Connect and open the session. Returns false if the session could not start.
    pub async fn start(
        &mut self,
        locale: &str,
        format: AudioSampleFormat,
        cancel: &CancellationToken,
    ) -> bool {
        if self.connection.is_some() || self.state != ClientSessionState::NotStarted {
            warn!("start called on a session that is already {}", self.state.as_str());
            return false;
        }

        match self.connect(locale, format, cancel).await {
            Ok(connection) => {
                info!(
                    mailbox = %connection.mailbox,
                    locale,
                    codec = %connection.encoder.codec(),
                    "speech recognition session started"
                );
                self.connection = Some(connection);
                true
            }
            Err(e) => {
                error!(
                    "could not start session with {}:{}: {}",
                    self.config.remote_host, self.config.remote_port, e
                );
                self.state = ClientSessionState::Failed;
                false
            }
        }
    }

    async fn connect(
        &self,
        locale: &str,
        format: AudioSampleFormat,
        cancel: &CancellationToken,
    ) -> SrResult<Connection> {
        let encoder = self.codecs.create_encoder(&self.config.codec, format)?;
        let address = format!("{}:{}", self.config.remote_host, self.config.remote_port);
        let limit = self.config.connect_timeout();

        let connect = tokio::time::timeout(limit, TcpStream::connect(&address));
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SrError::Cancelled),
            connected = connect => connected
                .map_err(|_| SrError::Timeout(format!("connecting to {} took over {:?}", address, limit)))??,
        };

        stream.set_nodelay(true)?;
        // One-shot session: reset on close instead of lingering
        #[allow(deprecated)]
        stream.set_linger(Some(Duration::ZERO))?;

        let post_office = PostOffice::new(
            stream,
            PostOfficeConfig::client(self.config.mailbox_lifetime()),
        );
        let connection = Connection {
            mailbox: post_office.create_mailbox(),
            post_office,
            encoder,
        };

        connection
            .send(SrMessageType::Start, Bytes::from(locale.to_string()), cancel)
            .await?;
        Ok(connection)
    }

    /// Encode and upload one block of samples.
    ///
    /// A transport failure moves the session to `Failed`.
    pub async fn write(&mut self, samples: &[f32], cancel: &CancellationToken) -> SrResult<()> {
        if !self.state.can_write() {
            return Err(SrError::Protocol(format!(
                "cannot write audio to a session that is {}",
                self.state.as_str()
            )));
        }

        let result = self.write_inner(samples, cancel).await;
        if let Err(e) = &result {
            if e.is_connection_fatal() {
                warn!("audio write failed: {}", e);
                self.state = ClientSessionState::Failed;
            }
        }
        result
    }

    async fn write_inner(&mut self, samples: &[f32], cancel: &CancellationToken) -> SrResult<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| SrError::Connection("session not started".to_string()))?;

        if !self.state.header_sent() {
            let header = format!(
                "{}|{}",
                connection.encoder.codec(),
                connection.encoder.codec_params()
            );
            debug!(%header, "sending audio header");
            connection
                .send(SrMessageType::SendAudioHeader, Bytes::from(header), cancel)
                .await?;
            self.state.transition(ClientSessionState::HeaderSent)?;
        }

        let chunk = connection.encoder.encode(samples);
        if !chunk.is_empty() {
            connection.send(SrMessageType::SendAudio, chunk, cancel).await?;
            self.state.transition(ClientSessionState::Streaming)?;
        }

        // Never wait here: a partial that is not queued yet is picked up later
        let polled = connection
            .post_office
            .try_receive(connection.mailbox, cancel, Duration::ZERO)
            .await?;
        if let Some(envelope) = polled {
            forward_interstitial(&self.partial_tx, envelope);
        }
        Ok(())
    }

    /// Finish the session, waiting at most `client.read_timeout_ms` for the result.
    pub async fn finish(&mut self, cancel: &CancellationToken) -> SpeechRecognitionResult {
        let timeout = self.config.read_timeout();
        self.finish_with_timeout(timeout, cancel).await
    }

    pub async fn finish_with_timeout(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> SpeechRecognitionResult {
        match self.finalize(timeout, cancel).await {
            Ok(result) => {
                self.state = ClientSessionState::Done;
                info!(
                    status = result.recognition_status.as_str(),
                    phrases = result.recognized_phrases.len(),
                    "recognition finished"
                );
                result
            }
            Err(e) => {
                warn!("recognition failed: {}", e);
                if !self.state.is_terminal() {
                    self.state = ClientSessionState::Failed;
                }
                SpeechRecognitionResult::error()
            }
        }
    }

    async fn finalize(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> SrResult<SpeechRecognitionResult> {
        let deadline = Instant::now() + timeout;
        self.state.transition(ClientSessionState::Finalizing)?;

        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| SrError::Connection("session not started".to_string()))?;

        let trailing = connection.encoder.finish();
        connection
            .send(SrMessageType::SendFinalAudio, trailing, cancel)
            .await?;
        connection
            .send(SrMessageType::CloseSocket, Bytes::new(), cancel)
            .await?;

        loop {
            let received = connection
                .post_office
                .try_receive(connection.mailbox, cancel, Duration::ZERO)
                .await?;

            match received {
                Some(envelope)
                    if SrMessageType::from_protocol_id(envelope.protocol_id)
                        == Some(SrMessageType::FinalResult) =>
                {
                    let json = envelope.payload_str()?;
                    debug!(reply_to = ?envelope.reply_to, "final result received");
                    return SpeechRecognitionResult::from_json(json);
                }
                Some(envelope) => forward_interstitial(&self.partial_tx, envelope),
                None => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SrError::Timeout(format!(
                            "no final result within {:?}",
                            timeout
                        )));
                    }
                    let nap = FINAL_POLL_INTERVAL.min(deadline - now);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SrError::Cancelled),
                        _ = tokio::time::sleep(nap) => {}
                    }
                }
            }
        }
    }

    /// Tear the session down. Safe to call more than once.
    pub fn dispose(&mut self) {
        if let Some(connection) = self.connection.take() {
            debug!(mailbox = %connection.mailbox, "disposing speech recognition session");
            connection.post_office.close();
        }
    }
}

/// Hand a non-final envelope to partial-result subscribers.
fn forward_interstitial(partials: &mpsc::UnboundedSender<String>, envelope: Envelope) {
    match SrMessageType::from_protocol_id(envelope.protocol_id) {
        Some(SrMessageType::PartialResult) => match envelope.payload_str() {
            Ok(text) => {
                // No subscriber is fine; partials are advisory
                let _ = partials.send(text.to_string());
            }
            Err(e) => warn!("discarding partial result: {}", e),
        },
        _ => debug!(
            protocol_id = envelope.protocol_id,
            "ignoring unexpected envelope while streaming"
        ),
    }
}

impl Drop for RemoteSpeechRecognizer {
    fn drop(&mut self) {
        self.dispose();
    }
}
