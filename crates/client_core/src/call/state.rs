use std::sync::Arc;

use peer_integration::{MediaHandle, TrackKind};
use serde::Serialize;
use shared::{
    domain::{CallKind, RoomId, UserId},
    error::{ErrorKind, RealtimeError},
    protocol::{OutboundEvent, RoomPayload},
};
use thiserror::Error;

use crate::channel::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Idle,
    Outgoing,
    Incoming,
    Connecting,
    Active,
    Ended,
}

impl CallPhase {
    pub fn can_transition_to(self, next: CallPhase) -> bool {
        use CallPhase::*;
        match (self, next) {
            (Idle, Outgoing) | (Idle, Incoming) => true,
            (Outgoing, Connecting) | (Incoming, Connecting) => true,
            (Connecting, Active) => true,
            (Ended, Idle) => true,
            (Idle, Ended) | (Ended, Ended) => false,
            (_, Ended) => true,
            _ => false,
        }
    }

    pub fn is_ringing(self) -> bool {
        matches!(self, Self::Outgoing | Self::Incoming)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Initiator,
    Callee,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum EndReason {
    HungUp,
    Declined,
    Timeout,
    RemoteEnded(Option<String>),
    PeerClosed,
    PeerFailed(String),
    MediaUnavailable(String),
    Shutdown,
}

/// Which side ended the call; remote ends are not echoed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("a call is already in progress ({0:?})")]
    Busy(CallPhase),
    #[error("no call in progress")]
    NoCall,
    #[error("cannot {action} while the call is {phase:?}")]
    InvalidState {
        action: &'static str,
        phase: CallPhase,
    },
    #[error("invalid call transition {from:?} -> {to:?}")]
    InvalidTransition { from: CallPhase, to: CallPhase },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("failed to acquire local media: {0}")]
    MediaAcquisitionFailed(String),
    #[error("peer link failed: {0}")]
    PeerLink(String),
    #[error("no local media")]
    NoLocalMedia,
    #[error("local media has no {0:?} track")]
    MissingTrack(TrackKind),
}

impl From<&CallError> for RealtimeError {
    fn from(value: &CallError) -> Self {
        let kind = match value {
            CallError::Channel(err) => err.kind(),
            CallError::MediaAcquisitionFailed(_) => ErrorKind::MediaAcquisitionFailed,
            CallError::PeerLink(_) => ErrorKind::PeerLink,
            _ => ErrorKind::InvalidState,
        };
        RealtimeError::new(kind, value.to_string())
    }
}

/// The one call a session may hold.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub room_id: Option<RoomId>,
    pub role: CallRole,
    pub phase: CallPhase,
    pub kind: CallKind,
    pub peer_user: UserId,
    pub local_media: Option<Arc<dyn MediaHandle>>,
    pub remote_media: Option<Arc<dyn MediaHandle>>,
}

impl CallSession {
    pub fn outgoing(callee: UserId, kind: CallKind) -> Self {
        Self {
            room_id: None,
            role: CallRole::Initiator,
            phase: CallPhase::Outgoing,
            kind,
            peer_user: callee,
            local_media: None,
            remote_media: None,
        }
    }

    pub fn incoming(room_id: RoomId, caller: UserId, kind: CallKind) -> Self {
        Self {
            room_id: Some(room_id),
            role: CallRole::Callee,
            phase: CallPhase::Incoming,
            kind,
            peer_user: caller,
            local_media: None,
            remote_media: None,
        }
    }

    pub fn advance(&mut self, next: CallPhase) -> Result<(), CallError> {
        if !self.phase.can_transition_to(next) {
            return Err(CallError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }

    pub fn is_room(&self, room_id: &RoomId) -> bool {
        self.room_id.as_ref() == Some(room_id)
    }

    /// The event announcing a local end to the other side, if any.
    pub fn closing_event(&self, origin: EndOrigin) -> Option<OutboundEvent> {
        if origin == EndOrigin::Remote {
            return None;
        }
        let payload = RoomPayload {
            room_id: self.room_id.clone()?,
        };
        Some(if self.phase == CallPhase::Incoming {
            OutboundEvent::DeclineCall(payload)
        } else {
            OutboundEvent::EndCall(payload)
        })
    }
}
