//! # Client Session Lifecycle
//!
//! ## States:
//! 1. **NotStarted**: connected, nothing but `START` sent
//! 2. **HeaderSent**: the audio header went out on the first write
//! 3. **Streaming**: at least one audio chunk has been sent
//! 4. **Finalizing**: final audio and close sent, waiting for the result
//! 5. **Done**: the session produced its result
//! 6. **Failed**: the transport failed; only `dispose` is meaningful now

use crate::error::{SrError, SrResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSessionState {
    NotStarted,
    HeaderSent,
    Streaming,
    Finalizing,
    Done,
    Failed,
}

impl ClientSessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientSessionState::NotStarted => "not_started",
            ClientSessionState::HeaderSent => "header_sent",
            ClientSessionState::Streaming => "streaming",
            ClientSessionState::Finalizing => "finalizing",
            ClientSessionState::Done => "done",
            ClientSessionState::Failed => "failed",
        }
    }

    /// Whether the audio header has already gone out.
    pub fn header_sent(&self) -> bool {
        matches!(
            self,
            ClientSessionState::HeaderSent | ClientSessionState::Streaming
        )
    }

    pub fn can_write(&self) -> bool {
        matches!(
            self,
            ClientSessionState::NotStarted
                | ClientSessionState::HeaderSent
                | ClientSessionState::Streaming
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientSessionState::Done | ClientSessionState::Failed)
    }

    fn allows(&self, next: ClientSessionState) -> bool {
        use ClientSessionState::*;

        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (NotStarted, HeaderSent)
                | (NotStarted, Finalizing)
                | (HeaderSent, Streaming)
                | (HeaderSent, Finalizing)
                | (Streaming, Streaming)
                | (Streaming, Finalizing)
                | (Finalizing, Done)
        )
    }

    /// Move to `next`, rejecting transitions the protocol does not allow.
    pub fn transition(&mut self, next: ClientSessionState) -> SrResult<()> {
        if !self.allows(next) {
            return Err(SrError::Protocol(format!(
                "cannot move session from {} to {}",
                self.as_str(),
                next.as_str()
            )));
        }
        *self = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = ClientSessionState::NotStarted;
        assert!(!state.header_sent());
        state.transition(ClientSessionState::HeaderSent).unwrap();
        assert!(state.header_sent());
        state.transition(ClientSessionState::Streaming).unwrap();
        state.transition(ClientSessionState::Streaming).unwrap();
        state.transition(ClientSessionState::Finalizing).unwrap();
        assert!(!state.can_write());
        state.transition(ClientSessionState::Done).unwrap();
        assert!(state.is_terminal());
    }

    #[test]
    fn test_header_is_sent_at_most_once() {
        let mut state = ClientSessionState::HeaderSent;
        assert!(state.transition(ClientSessionState::HeaderSent).is_err());
        state.transition(ClientSessionState::Streaming).unwrap();
        assert!(state.transition(ClientSessionState::HeaderSent).is_err());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut done = ClientSessionState::Done;
        assert!(done.transition(ClientSessionState::Failed).is_err());
        assert!(done.transition(ClientSessionState::Streaming).is_err());

        let mut failed = ClientSessionState::Streaming;
        failed.transition(ClientSessionState::Failed).unwrap();
        assert!(failed.transition(ClientSessionState::Finalizing).is_err());
    }
}
