//! # Speech Recognition Protocol
//!
//! The seven message kinds exchanged over one mailbox, and the client and
//! server state machines that speak them.
//!
//! | Code | Kind | Direction | Payload |
//! |---|---|---|---|
//! | 0 | `CloseSocket` | either | empty |
//! | 1 | `Start` | client → server | UTF-8 locale tag |
//! | 2 | `SendAudioHeader` | client → server | UTF-8 `"<codec>\|<params>"` |
//! | 3 | `SendAudio` | client → server | encoded audio bytes |
//! | 4 | `SendFinalAudio` | client → server | trailing encoded bytes, or empty |
//! | 5 | `PartialResult` | server → client | UTF-8 text |
//! | 6 | `FinalResult` | server → client | UTF-8 JSON result |

pub mod client;
pub mod server;
pub mod session;

use std::fmt;

pub use client::RemoteSpeechRecognizer;
pub use server::{serve, ServerContext, ServerSession, SessionEnd, SessionReport};
pub use session::ClientSessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SrMessageType {
    CloseSocket = 0,
    Start = 1,
    SendAudioHeader = 2,
    SendAudio = 3,
    SendFinalAudio = 4,
    PartialResult = 5,
    FinalResult = 6,
}

impl SrMessageType {
    /// Map a wire protocol id; `None` for kinds this build does not know.
    pub fn from_protocol_id(id: u16) -> Option<Self> {
        match id {
            0 => Some(SrMessageType::CloseSocket),
            1 => Some(SrMessageType::Start),
            2 => Some(SrMessageType::SendAudioHeader),
            3 => Some(SrMessageType::SendAudio),
            4 => Some(SrMessageType::SendFinalAudio),
            5 => Some(SrMessageType::PartialResult),
            6 => Some(SrMessageType::FinalResult),
            _ => None,
        }
    }

    pub fn protocol_id(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for SrMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SrMessageType::CloseSocket => "CLOSE_SOCKET",
            SrMessageType::Start => "START",
            SrMessageType::SendAudioHeader => "SEND_AUDIO_HEADER",
            SrMessageType::SendAudio => "SEND_AUDIO",
            SrMessageType::SendFinalAudio => "SEND_FINAL_AUDIO",
            SrMessageType::PartialResult => "PARTIAL_RESULT",
            SrMessageType::FinalResult => "FINAL_RESULT",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_ids_are_stable() {
        assert_eq!(SrMessageType::CloseSocket.protocol_id(), 0);
        assert_eq!(SrMessageType::FinalResult.protocol_id(), 6);
        for id in 0..=6 {
            let kind = SrMessageType::from_protocol_id(id).unwrap();
            assert_eq!(kind.protocol_id(), id);
        }
        assert_eq!(SrMessageType::from_protocol_id(7), None);
        assert_eq!(SrMessageType::SendAudioHeader.to_string(), "SEND_AUDIO_HEADER");
    }
}
