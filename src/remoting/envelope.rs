//! Envelopes: the unit the post office carries between the two ends of a socket.

use bytes::Bytes;
use std::fmt;

/// Identifies one logical conversation on a connection.
///
/// All envelopes of one recognition session share the same mailbox id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MailboxId(pub u32);

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "box#{}", self.0)
    }
}

/// Transport-generated message identifier. Never zero on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg#{}", self.0)
    }
}

/// One protocol message.
///
/// ## Ownership:
/// The payload is a `Bytes` handle that is moved into
/// [`PostOffice::send`](super::PostOffice::send) together with the envelope,
/// so the sender cannot touch the buffer after handoff. The receiver owns
/// whatever it gets back from `try_receive` and releases it by dropping it.
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(Clone))]
pub struct Envelope {
    pub mailbox_id: MailboxId,
    pub protocol_id: u16,
    pub payload: Bytes,
    pub message_id: MessageId,
    pub reply_to: Option<MessageId>,
}

impl Envelope {
    /// An initiating envelope (no reply-to).
    pub fn new(
        mailbox_id: MailboxId,
        protocol_id: u16,
        payload: impl Into<Bytes>,
        message_id: MessageId,
    ) -> Self {
        Self {
            mailbox_id,
            protocol_id,
            payload: payload.into(),
            message_id,
            reply_to: None,
        }
    }

    /// An envelope answering `reply_to`.
    pub fn reply(
        mailbox_id: MailboxId,
        protocol_id: u16,
        payload: impl Into<Bytes>,
        message_id: MessageId,
        reply_to: MessageId,
    ) -> Self {
        Self {
            reply_to: Some(reply_to),
            ..Self::new(mailbox_id, protocol_id, payload, message_id)
        }
    }

    /// A zero-length payload, used as a pure signal.
    pub fn is_signal(&self) -> bool {
        self.payload.is_empty()
    }

    /// Interpret the payload as UTF-8 text.
    pub fn payload_str(&self) -> crate::error::SrResult<&str> {
        Ok(std::str::from_utf8(&self.payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_sets_reply_to() {
        let env = Envelope::reply(MailboxId(7), 5, "hello", MessageId(12), MessageId(9));
        assert_eq!(env.reply_to, Some(MessageId(9)));
        assert_eq!(env.payload_str().unwrap(), "hello");
        assert!(!env.is_signal());
    }

    #[test]
    fn test_invalid_utf8_payload_is_protocol_error() {
        let env = Envelope::new(MailboxId(1), 1, vec![0xff, 0xfe], MessageId(1));
        assert!(env.payload_str().is_err());
        assert!(Envelope::new(MailboxId(1), 0, Bytes::new(), MessageId(2)).is_signal());
    }
}
