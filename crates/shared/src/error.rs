use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Backend refused the credentials; the session must sign out.
    AuthRejected,
    Transport,
    ConnectionDegraded,
    SendFailed,
    MalformedEvent,
    MediaAcquisitionFailed,
    PeerLink,
    InvalidState,
}

impl ErrorKind {
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::AuthRejected)
    }

    /// Whether the user can retry the failed action as-is.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Transport | Self::ConnectionDegraded | Self::SendFailed
        )
    }
}

/// Error payload surfaced to UI subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct RealtimeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RealtimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Failure to decode a frame coming off the event channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame is not valid json: {0}")]
    InvalidJson(String),
    #[error("event '{event}' is missing required field '{field}'")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },
    #[error("event '{event}' has an invalid payload: {reason}")]
    InvalidPayload { event: &'static str, reason: String },
}

impl From<ProtocolError> for RealtimeError {
    fn from(value: ProtocolError) -> Self {
        Self::new(ErrorKind::MalformedEvent, value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_auth_rejection_is_fatal() {
        assert!(ErrorKind::AuthRejected.is_fatal());
        assert!(!ErrorKind::Transport.is_fatal());
        assert!(!ErrorKind::PeerLink.is_fatal());
    }

    #[test]
    fn send_failures_are_retryable() {
        assert!(ErrorKind::SendFailed.is_retryable());
        assert!(!ErrorKind::MalformedEvent.is_retryable());
    }

    #[test]
    fn protocol_errors_map_to_malformed_event() {
        let err: RealtimeError = ProtocolError::MissingField {
            event: "receive_message",
            field: "_id",
        }
        .into();
        assert_eq!(err.kind, ErrorKind::MalformedEvent);
        assert!(err.message.contains("_id"));
    }
}
