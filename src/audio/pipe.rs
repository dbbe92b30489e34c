//! Byte pipe between the session loop (writer) and a decoder (reader).

use bytes::{Buf, Bytes, BytesMut};

/// Growable FIFO of encoded audio bytes with a closed-for-write flag.
///
/// The server appends `SEND_AUDIO` payloads; the decoder consumes from the
/// front. Closing tells the decoder no more bytes will come, so it can
/// flush whatever partial frame it was holding back.
#[derive(Debug, Default)]
pub struct AudioPipe {
    buf: BytesMut,
    closed: bool,
    total_written: u64,
}

impl AudioPipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes. Writes after `close` are ignored.
    pub fn write(&mut self, data: &[u8]) {
        if self.closed {
            tracing::warn!(bytes = data.len(), "write to closed audio pipe ignored");
            return;
        }
        self.buf.extend_from_slice(data);
        self.total_written += data.len() as u64;
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes currently buffered.
    pub fn available(&self) -> usize {
        self.buf.len()
    }

    /// Bytes ever written.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Look at buffered bytes without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.buf
    }

    /// Consume up to `max` bytes from the front.
    pub fn read(&mut self, max: usize) -> Bytes {
        let n = max.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    /// Consume the largest prefix whose length is a multiple of `unit`.
    pub fn read_aligned(&mut self, unit: usize) -> Bytes {
        let unit = unit.max(1);
        let n = self.buf.len() - self.buf.len() % unit;
        self.read(n)
    }

    /// Drop `n` bytes from the front.
    pub fn skip(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }
}
