//! # Wire Format
//!
//! Envelopes travel as one or more fragments, each with a fixed 36-byte
//! little-endian header:
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 4 | capture pattern `DPoP` |
//! | 4 | 4 | mailbox id |
//! | 8 | 4 | protocol id |
//! | 12 | 4 | message id |
//! | 16 | 4 | reply-to id (0 = none) |
//! | 20 | 2 | flags (BEGIN, END) |
//! | 22 | 2 | fragment payload length |
//! | 24 | 8 | send timestamp (µs since epoch) |
//! | 32 | 4 | CRC-32C of header (this field zeroed) + payload |
//!
//! ## Resilience:
//! The decoder scans for the capture pattern and validates the checksum, so
//! garbage on the stream costs us the damaged fragment and nothing else.

use crate::error::{SrError, SrResult};
use crate::remoting::envelope::{Envelope, MailboxId, MessageId};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const CAPTURE_PATTERN: [u8; 4] = *b"DPoP";
pub const HEADER_LEN: usize = 36;

/// A fragment, header included, must fit in 64KB; the length field is a u16 anyway.
pub const MAX_FRAGMENT_PAYLOAD: usize = u16::MAX as usize - HEADER_LEN;

pub const FLAG_BEGIN: u16 = 0x0001;
pub const FLAG_END: u16 = 0x0002;

const CRC_OFFSET: usize = 32;

/// Unfinished multi-fragment messages one connection may hold at once.
pub const MAX_PENDING_MESSAGES: usize = 64;

/// Largest envelope payload the reassembler will build.
pub const MAX_ENVELOPE_BYTES: usize = 16 * 1024 * 1024;

/// Decoded fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub mailbox_id: u32,
    pub protocol_id: u32,
    pub message_id: u32,
    pub reply_to: u32,
    pub flags: u16,
    pub payload_len: u16,
    pub timestamp_micros: i64,
    pub checksum: u32,
}

impl FragmentHeader {
    fn parse(raw: &[u8]) -> Self {
        Self {
            mailbox_id: LittleEndian::read_u32(&raw[4..8]),
            protocol_id: LittleEndian::read_u32(&raw[8..12]),
            message_id: LittleEndian::read_u32(&raw[12..16]),
            reply_to: LittleEndian::read_u32(&raw[16..20]),
            flags: LittleEndian::read_u16(&raw[20..22]),
            payload_len: LittleEndian::read_u16(&raw[22..24]),
            timestamp_micros: LittleEndian::read_i64(&raw[24..32]),
            checksum: LittleEndian::read_u32(&raw[32..36]),
        }
    }

    fn write(&self, raw: &mut [u8; HEADER_LEN]) {
        raw[0..4].copy_from_slice(&CAPTURE_PATTERN);
        LittleEndian::write_u32(&mut raw[4..8], self.mailbox_id);
        LittleEndian::write_u32(&mut raw[8..12], self.protocol_id);
        LittleEndian::write_u32(&mut raw[12..16], self.message_id);
        LittleEndian::write_u32(&mut raw[16..20], self.reply_to);
        LittleEndian::write_u16(&mut raw[20..22], self.flags);
        LittleEndian::write_u16(&mut raw[22..24], self.payload_len);
        LittleEndian::write_i64(&mut raw[24..32], self.timestamp_micros);
        LittleEndian::write_u32(&mut raw[32..36], 0);
    }
}

/// One fragment as read off the socket.
#[derive(Debug, Clone)]
pub struct WireFragment {
    pub header: FragmentHeader,
    pub payload: Bytes,
}

const CRC32C_TABLE: [u32; 256] = build_crc32c_table();

const fn build_crc32c_table() -> [u32; 256] {
    // Castagnoli polynomial, reflected
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0x82F6_3B78
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Running CRC-32C.
#[derive(Debug, Clone, Copy)]
pub struct Crc32c(u32);

impl Crc32c {
    pub fn new() -> Self {
        Self(0xFFFF_FFFF)
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.0;
        for &byte in data {
            crc = CRC32C_TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8);
        }
        self.0 = crc;
    }

    pub fn finish(self) -> u32 {
        !self.0
    }
}

impl Default for Crc32c {
    fn default() -> Self {
        Self::new()
    }
}

fn fragment_checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut crc = Crc32c::new();
    crc.update(&header[..CRC_OFFSET]);
    crc.update(&[0u8; 4]);
    crc.update(payload);
    crc.finish()
}

/// Serialize an envelope into one or more fragments appended to `out`.
///
/// A zero-length payload still produces one fragment flagged BEGIN|END.
pub fn encode_envelope(envelope: &Envelope, timestamp_micros: i64, out: &mut BytesMut) {
    let payload = &envelope.payload[..];
    let fragment_count = payload.len().div_ceil(MAX_FRAGMENT_PAYLOAD).max(1);
    out.reserve(payload.len() + fragment_count * HEADER_LEN);

    let mut offset = 0;
    for index in 0..fragment_count {
        let len = (payload.len() - offset).min(MAX_FRAGMENT_PAYLOAD);
        let mut flags = 0;
        if index == 0 {
            flags |= FLAG_BEGIN;
        }
        if index == fragment_count - 1 {
            flags |= FLAG_END;
        }

        let header = FragmentHeader {
            mailbox_id: envelope.mailbox_id.0,
            protocol_id: envelope.protocol_id as u32,
            message_id: envelope.message_id.0,
            reply_to: envelope.reply_to.map(|id| id.0).unwrap_or(0),
            flags,
            payload_len: len as u16,
            timestamp_micros,
            checksum: 0,
        };

        let mut raw = [0u8; HEADER_LEN];
        header.write(&mut raw);
        let body = &payload[offset..offset + len];
        let checksum = fragment_checksum(&raw, body);
        LittleEndian::write_u32(&mut raw[CRC_OFFSET..HEADER_LEN], checksum);

        out.extend_from_slice(&raw);
        out.extend_from_slice(body);
        offset += len;
    }
}

/// Incremental fragment decoder over a byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    corrupt_fragments: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of fragments dropped for failing checksum validation.
    pub fn corrupt_fragments(&self) -> u64 {
        self.corrupt_fragments
    }

    /// Pull the next complete, valid fragment out of the buffer, if any.
    pub fn next_fragment(&mut self) -> Option<WireFragment> {
        loop {
            match find_capture_pattern(&self.buf) {
                Some(start) => self.buf.advance(start),
                None => {
                    // A capture pattern may straddle the next read
                    let keep = self.buf.len().min(CAPTURE_PATTERN.len() - 1);
                    let junk = self.buf.len() - keep;
                    self.buf.advance(junk);
                    return None;
                }
            }

            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let header = FragmentHeader::parse(&self.buf[..HEADER_LEN]);
            let total = HEADER_LEN + header.payload_len as usize;
            if self.buf.len() < total {
                return None;
            }

            let computed = fragment_checksum(&self.buf[..HEADER_LEN], &self.buf[HEADER_LEN..total]);
            if computed != header.checksum {
                self.corrupt_fragments += 1;
                tracing::debug!(
                    mailbox = header.mailbox_id,
                    message = header.message_id,
                    "dropping fragment that failed CRC validation"
                );
                // Skip this capture pattern and rescan
                self.buf.advance(1);
                continue;
            }

            let frame = self.buf.split_to(total).freeze();
            return Some(WireFragment {
                header,
                payload: frame.slice(HEADER_LEN..),
            });
        }
    }
}

fn find_capture_pattern(buf: &[u8]) -> Option<usize> {
    buf.windows(CAPTURE_PATTERN.len())
        .position(|window| window == CAPTURE_PATTERN)
}

struct PartialEnvelope {
    header: FragmentHeader,
    payload: BytesMut,
    started: Instant,
}

/// Joins fragments back into envelopes, keyed by (mailbox, message id).
///
/// Bounded: at most `max_pending` unfinished messages and `max_bytes` per
/// message. Messages whose END never arrives are dropped by [`Reassembler::expire`].
pub struct Reassembler {
    partial: HashMap<(u32, u32), PartialEnvelope>,
    max_pending: usize,
    max_bytes: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::with_limits(MAX_PENDING_MESSAGES, MAX_ENVELOPE_BYTES)
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_pending: usize, max_bytes: usize) -> Self {
        Self {
            partial: HashMap::new(),
            max_pending: max_pending.max(1),
            max_bytes,
        }
    }

    /// Feed one fragment; returns the envelope when its last fragment arrives.
    pub fn push(&mut self, fragment: WireFragment) -> SrResult<Option<Envelope>> {
        let header = fragment.header;
        let key = (header.mailbox_id, header.message_id);
        let begin = header.flags & FLAG_BEGIN != 0;
        let end = header.flags & FLAG_END != 0;

        if begin && end {
            return to_envelope(&header, fragment.payload).map(Some);
        }

        if begin {
            if !self.partial.contains_key(&key) && self.partial.len() >= self.max_pending {
                return Err(SrError::Protocol(format!(
                    "{} messages already unfinished; dropping message {}",
                    self.partial.len(),
                    header.message_id
                )));
            }
            let mut payload = BytesMut::with_capacity(MAX_FRAGMENT_PAYLOAD * 2);
            payload.extend_from_slice(&fragment.payload);
            let started = Instant::now();
            if self
                .partial
                .insert(key, PartialEnvelope { header, payload, started })
                .is_some()
            {
                tracing::warn!(
                    mailbox = header.mailbox_id,
                    message = header.message_id,
                    "restarted a message whose earlier fragments never finished"
                );
            }
            return Ok(None);
        }

        let Some(partial) = self.partial.get_mut(&key) else {
            tracing::warn!(
                mailbox = header.mailbox_id,
                message = header.message_id,
                "dropping continuation fragment with no beginning"
            );
            return Ok(None);
        };

        if partial.payload.len() + fragment.payload.len() > self.max_bytes {
            self.partial.remove(&key);
            return Err(SrError::Protocol(format!(
                "message {} exceeds {} bytes",
                header.message_id, self.max_bytes
            )));
        }
        partial.payload.extend_from_slice(&fragment.payload);

        if !end {
            return Ok(None);
        }

        match self.partial.remove(&key) {
            Some(done) => to_envelope(&done.header, done.payload.freeze()).map(Some),
            None => Ok(None),
        }
    }

    /// Drop unfinished messages started more than `max_age` ago. Returns how many.
    pub fn expire(&mut self, max_age: Duration) -> usize {
        let before = self.partial.len();
        self.partial.retain(|_, partial| partial.started.elapsed() < max_age);
        before - self.partial.len()
    }

    /// Messages with fragments still outstanding.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

fn to_envelope(header: &FragmentHeader, payload: Bytes) -> SrResult<Envelope> {
    let protocol_id = u16::try_from(header.protocol_id).map_err(|_| {
        SrError::Protocol(format!("protocol id {} out of range", header.protocol_id))
    })?;

    Ok(Envelope {
        mailbox_id: MailboxId(header.mailbox_id),
        protocol_id,
        payload,
        message_id: MessageId(header.message_id),
        reply_to: (header.reply_to != 0).then_some(MessageId(header.reply_to)),
    })
}
