//! # Post Office
//!
//! Multiplexes envelopes for many mailboxes over one duplex byte stream.
//!
//! ## Tasks:
//! - A background reader task deframes the stream and routes each envelope
//!   into its mailbox queue, creating the mailbox on first sight.
//! - Writers share one `tokio::sync::Mutex` around the write half, so the
//!   main session loop and the partial-result relay may send concurrently.
//!
//! ## Lifetime:
//! The transport closes on EOF, read error, idle-read timeout, an explicit
//! [`PostOffice::close`], or when the last handle is dropped. Once closed,
//! receivers still drain whatever was already queued and then fail with
//! [`SrError::Connection`].

use crate::config::ProtocolConfig;
use crate::error::{SrError, SrResult};
use crate::remoting::envelope::{Envelope, MailboxId, MessageId};
use crate::remoting::wire::{encode_envelope, FrameDecoder, Reassembler};
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;
const MAILBOX_ID_LIMIT: u32 = 1_000_000;
const SERVER_MAILBOX_BASE: u32 = 1;
const CLIENT_MAILBOX_BASE: u32 = 500_000;

/// Which end of the connection this transport serves.
///
/// Only affects the range transient mailbox ids are drawn from, so that
/// ids minted by the two sides never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct PostOfficeConfig {
    pub role: TransportRole,
    /// Close the transport when nothing has been read for this long
    pub idle_read_timeout: Option<Duration>,
    /// Unused mailboxes are pruned after this long
    pub mailbox_lifetime: Duration,
}

impl PostOfficeConfig {
    pub fn client(mailbox_lifetime: Duration) -> Self {
        Self {
            role: TransportRole::Client,
            idle_read_timeout: None,
            mailbox_lifetime,
        }
    }

    pub fn server(protocol: &ProtocolConfig) -> Self {
        Self {
            role: TransportRole::Server,
            idle_read_timeout: Some(protocol.socket_idle_timeout()),
            mailbox_lifetime: protocol.mailbox_lifetime(),
        }
    }
}

type SharedReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<Envelope>>>;

struct Mailbox {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: SharedReceiver,
    last_touched: Instant,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
            last_touched: Instant::now(),
        }
    }
}

/// State shared with the reader task. Holds no reference to the writer,
/// so dropping every `PostOffice` handle tears the connection down.
struct Registry {
    mailboxes: Mutex<HashMap<MailboxId, Mailbox>>,
    new_mailbox_tx: mpsc::UnboundedSender<MailboxId>,
    /// Only a server waits for peers to open mailboxes
    announce_new_mailboxes: bool,
    closed: CancellationToken,
    mailbox_lifetime: Duration,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<MailboxId, Mailbox>> {
        self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: MailboxId) {
        self.lock().entry(id).or_insert_with(Mailbox::new);
    }

    fn receiver(&self, id: MailboxId) -> SharedReceiver {
        let mut mailboxes = self.lock();
        let mailbox = mailboxes.entry(id).or_insert_with(Mailbox::new);
        mailbox.last_touched = Instant::now();
        mailbox.rx.clone()
    }

    fn deliver(&self, envelope: Envelope) {
        let id = envelope.mailbox_id;
        let mut mailboxes = self.lock();
        let mailbox = mailboxes.entry(id).or_insert_with(|| {
            if self.announce_new_mailboxes {
                // Nobody is listening on the other end only if the transport is closing
                let _ = self.new_mailbox_tx.send(id);
            }
            Mailbox::new()
        });
        mailbox.last_touched = Instant::now();
        // The receiver lives in the same map entry, so this cannot fail
        let _ = mailbox.tx.send(envelope);
    }

    /// Drop idle mailboxes that no receiver is currently holding.
    fn prune(&self) {
        let lifetime = self.mailbox_lifetime;
        let mut mailboxes = self.lock();
        let before = mailboxes.len();
        mailboxes.retain(|_, mailbox| {
            Arc::strong_count(&mailbox.rx) > 1 || mailbox.last_touched.elapsed() < lifetime
        });
        let pruned = before - mailboxes.len();
        if pruned > 0 {
            debug!(pruned, "pruned idle mailboxes");
        }
    }
}

struct Inner {
    writer: AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>,
    registry: Arc<Registry>,
    new_mailboxes: AsyncMutex<mpsc::UnboundedReceiver<MailboxId>>,
    next_message_id: AtomicU32,
    next_mailbox_id: AtomicU32,
    mailbox_base: u32,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.registry.closed.cancel();
    }
}

/// Handle to one connection's transport. Clones share the connection.
#[derive(Clone)]
pub struct PostOffice {
    inner: Arc<Inner>,
}

enum Wake<T> {
    Cancelled,
    Ready(T),
    TimedOut,
    Closed,
}

impl PostOffice {
    /// Wrap a connected byte stream and start the reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S>(stream: S, config: PostOfficeConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (new_mailbox_tx, new_mailbox_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(Registry {
            mailboxes: Mutex::new(HashMap::new()),
            new_mailbox_tx,
            announce_new_mailboxes: config.role == TransportRole::Server,
            closed: CancellationToken::new(),
            mailbox_lifetime: config.mailbox_lifetime,
        });

        tokio::spawn(read_loop(reader, registry.clone(), config.idle_read_timeout));

        let mailbox_base = match config.role {
            TransportRole::Client => CLIENT_MAILBOX_BASE,
            TransportRole::Server => SERVER_MAILBOX_BASE,
        };

        Self {
            inner: Arc::new(Inner {
                writer: AsyncMutex::new(Box::new(writer)),
                registry,
                new_mailboxes: AsyncMutex::new(new_mailbox_rx),
                next_message_id: AtomicU32::new(1),
                next_mailbox_id: AtomicU32::new(0),
                mailbox_base,
            }),
        }
    }

    /// Next message id for this connection. Never zero.
    pub fn generate_message_id(&self) -> MessageId {
        loop {
            let id = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return MessageId(id);
            }
        }
    }

    /// Allocate a transient mailbox locally. The peer learns it from the
    /// first envelope we send, so there is no round trip.
    pub fn create_mailbox(&self) -> MailboxId {
        let span = MAILBOX_ID_LIMIT - self.inner.mailbox_base;
        let n = self.inner.next_mailbox_id.fetch_add(1, Ordering::Relaxed);
        let id = MailboxId(self.inner.mailbox_base + n % span);
        self.inner.registry.register(id);
        id
    }

    /// Wait until an envelope arrives for a mailbox we have not seen before.
    pub async fn wait_for_new_mailbox(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> SrResult<MailboxId> {
        let mut rx = self.inner.new_mailboxes.lock().await;
        if let Ok(id) = rx.try_recv() {
            return Ok(id);
        }
        if self.is_closed() {
            return Err(SrError::Connection("transport closed".to_string()));
        }

        let closed = &self.inner.registry.closed;
        let wake = tokio::select! {
            biased;
            _ = cancel.cancelled() => Wake::Cancelled,
            received = tokio::time::timeout(timeout, rx.recv()) => match received {
                Ok(Some(id)) => Wake::Ready(id),
                Ok(None) => Wake::Closed,
                Err(_) => Wake::TimedOut,
            },
            _ = closed.cancelled() => Wake::Closed,
        };

        match wake {
            Wake::Ready(id) => Ok(id),
            Wake::Cancelled => Err(SrError::Cancelled),
            Wake::TimedOut => Err(SrError::Timeout(format!(
                "no mailbox opened within {:?}",
                timeout
            ))),
            Wake::Closed => match rx.try_recv() {
                Ok(id) => Ok(id),
                Err(_) => Err(SrError::Connection("transport closed".to_string())),
            },
        }
    }

    /// Serialize and write one envelope.
    ///
    /// The envelope is consumed; its buffer is released once the bytes are
    /// on the wire, however the call ends. A write failure closes the transport.
    pub async fn send(&self, envelope: Envelope, cancel: &CancellationToken) -> SrResult<()> {
        if self.is_closed() {
            return Err(SrError::Connection("transport closed".to_string()));
        }

        let mut frame = BytesMut::new();
        encode_envelope(&envelope, chrono::Utc::now().timestamp_micros(), &mut frame);
        drop(envelope);

        let write = async {
            let mut writer = self.inner.writer.lock().await;
            writer.write_all(&frame).await?;
            writer.flush().await
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SrError::Cancelled),
            result = write => result,
        };

        result.map_err(|e| {
            warn!("send failed, closing transport: {}", e);
            self.close();
            SrError::from(e)
        })
    }

    /// Receive the next envelope for `mailbox`.
    ///
    /// Returns `Ok(None)` when nothing arrived within `timeout`; a zero
    /// timeout only checks what is already queued.
    pub async fn try_receive(
        &self,
        mailbox: MailboxId,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> SrResult<Option<Envelope>> {
        let receiver = self.inner.registry.receiver(mailbox);
        let mut rx = receiver.lock().await;

        if let Ok(envelope) = rx.try_recv() {
            return Ok(Some(envelope));
        }
        if self.is_closed() {
            return Err(SrError::Connection("transport closed".to_string()));
        }
        if timeout.is_zero() {
            return Ok(None);
        }

        let closed = &self.inner.registry.closed;
        let wake = tokio::select! {
            biased;
            _ = cancel.cancelled() => Wake::Cancelled,
            received = tokio::time::timeout(timeout, rx.recv()) => match received {
                Ok(Some(envelope)) => Wake::Ready(envelope),
                Ok(None) => Wake::Closed,
                Err(_) => Wake::TimedOut,
            },
            _ = closed.cancelled() => Wake::Closed,
        };

        match wake {
            Wake::Ready(envelope) => Ok(Some(envelope)),
            Wake::Cancelled => Err(SrError::Cancelled),
            Wake::TimedOut => Ok(None),
            Wake::Closed => match rx.try_recv() {
                Ok(envelope) => Ok(Some(envelope)),
                Err(_) => Err(SrError::Connection("transport closed".to_string())),
            },
        }
    }

    /// Stop the reader and fail all further operations.
    pub fn close(&self) {
        self.inner.registry.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.registry.closed.is_cancelled()
    }

    /// Resolves once the transport has closed, for whatever reason.
    pub async fn closed(&self) {
        self.inner.registry.closed.cancelled().await
    }

    /// Flush and shut down the write half, then close.
    pub async fn shutdown(&self) {
        self.close();
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("write half shutdown: {}", e);
        }
    }
}

async fn read_loop<R>(mut reader: R, registry: Arc<Registry>, idle_timeout: Option<Duration>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut reassembler = Reassembler::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut last_prune = Instant::now();

    let outcome: SrResult<()> = loop {
        let read = async {
            match idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, reader.read(&mut buf)).await {
                    Ok(result) => result.map_err(SrError::from),
                    Err(_) => Err(SrError::Timeout(format!("socket idle for {:?}", limit))),
                },
                None => reader.read(&mut buf).await.map_err(SrError::from),
            }
        };

        let n = tokio::select! {
            _ = registry.closed.cancelled() => break Ok(()),
            result = read => match result {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e),
            },
        };

        decoder.extend(&buf[..n]);
        while let Some(fragment) = decoder.next_fragment() {
            match reassembler.push(fragment) {
                Ok(Some(envelope)) => registry.deliver(envelope),
                Ok(None) => {}
                Err(e) => warn!("dropping undeliverable envelope: {}", e),
            }
        }

        if last_prune.elapsed() >= registry.mailbox_lifetime {
            registry.prune();
            let expired = reassembler.expire(registry.mailbox_lifetime);
            if expired > 0 {
                debug!(expired, "dropped messages whose fragments never finished");
            }
            last_prune = Instant::now();
        }
    };

    match outcome {
        Ok(()) => debug!("transport reader finished"),
        Err(e) => debug!("transport reader stopped: {}", e),
    }
    if decoder.corrupt_fragments() > 0 {
        warn!(
            corrupt = decoder.corrupt_fragments(),
            "connection carried corrupt fragments"
        );
    }
    registry.closed.cancel();
}
