//! Mailbox transport: envelopes, their wire framing, and the per-connection
//! post office that routes them.

pub mod envelope;
pub mod post_office;
pub mod wire;

pub use envelope::{Envelope, MailboxId, MessageId};
pub use post_office::{PostOffice, PostOfficeConfig, TransportRole};
