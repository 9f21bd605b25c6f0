use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{
        CallKind, Conversation, ConversationId, MessageId, Notification, Post, PostId, RoomId,
        UserId, UserRef,
    },
    error::ProtocolError,
};

pub const CONNECT_EVENT: &str = "connect";
pub const CONNECT_ERROR_EVENT: &str = "connect_error";
pub const ACK_EVENT: &str = "ack";

/// Events the client emits on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    #[serde(rename = "join")]
    Join(UserId),
    #[serde(rename = "send_message")]
    SendMessage(SendMessagePayload),
    #[serde(rename = "typing")]
    Typing(ConversationId),
    #[serde(rename = "stop_typing")]
    StopTyping(ConversationId),
    #[serde(rename = "mark_message_read")]
    MarkMessageRead(ReadReceipt),
    #[serde(rename = "initiate-call")]
    InitiateCall(InitiateCall),
    #[serde(rename = "join-call-room")]
    JoinCallRoom(RoomId),
    #[serde(rename = "accept-call")]
    AcceptCall(RoomPayload),
    #[serde(rename = "decline-call")]
    DeclineCall(RoomPayload),
    #[serde(rename = "end-call")]
    EndCall(RoomPayload),
    #[serde(rename = "webrtc-signal")]
    WebrtcSignal(SignalEnvelope),
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "manual-disconnect")]
    ManualDisconnect,
    #[serde(rename = "send_notification")]
    SendNotification(NotificationRequest),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::SendMessage(_) => "send_message",
            Self::Typing(_) => "typing",
            Self::StopTyping(_) => "stop_typing",
            Self::MarkMessageRead(_) => "mark_message_read",
            Self::InitiateCall(_) => "initiate-call",
            Self::JoinCallRoom(_) => "join-call-room",
            Self::AcceptCall(_) => "accept-call",
            Self::DeclineCall(_) => "decline-call",
            Self::EndCall(_) => "end-call",
            Self::WebrtcSignal(_) => "webrtc-signal",
            Self::Heartbeat => "heartbeat",
            Self::ManualDisconnect => "manual-disconnect",
            Self::SendNotification(_) => "send_notification",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessagePayload {
    pub content: String,
    pub conversation: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCall {
    pub callee_id: UserId,
    #[serde(rename = "type")]
    pub kind: CallKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub room_id: RoomId,
    #[serde(default)]
    pub signal: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Like,
    Comment,
    Follow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<PostId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_text: Option<String>,
}

/// Serialize an outbound event into one text frame, optionally tagged with an
/// ack id the server echoes back.
pub fn encode_frame(event: &OutboundEvent, ack: Option<u64>) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(event)?;
    if let (Some(id), Value::Object(map)) = (ack, &mut value) {
        map.insert("ack".to_owned(), Value::from(id));
    }
    serde_json::to_string(&value)
}

/// Names of the inbound events a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ReceiveMessage,
    UserTyping,
    UserStopTyping,
    CallInitiated,
    IncomingCall,
    CallAccepted,
    CallRejected,
    CallEnded,
    WebrtcSignal,
    NewNotification,
    NewPost,
    LikeUpdate,
    ConversationUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        Self::ReceiveMessage,
        Self::UserTyping,
        Self::UserStopTyping,
        Self::CallInitiated,
        Self::IncomingCall,
        Self::CallAccepted,
        Self::CallRejected,
        Self::CallEnded,
        Self::WebrtcSignal,
        Self::NewNotification,
        Self::NewPost,
        Self::LikeUpdate,
        Self::ConversationUpdated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReceiveMessage => "receive_message",
            Self::UserTyping => "user_typing",
            Self::UserStopTyping => "user_stop_typing",
            Self::CallInitiated => "call-initiated",
            Self::IncomingCall => "incoming-call",
            Self::CallAccepted => "call-accepted",
            Self::CallRejected => "call-rejected",
            Self::CallEnded => "call-ended",
            Self::WebrtcSignal => "webrtc-signal",
            Self::NewNotification => "new_notification",
            Self::NewPost => "new_post",
            Self::LikeUpdate => "like_update",
            Self::ConversationUpdated => "conversation_updated",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

/// A validated `receive_message` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInitiated {
    pub room_id: RoomId,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<CallKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCall {
    pub room_id: RoomId,
    pub caller: UserRef,
    #[serde(rename = "type")]
    pub kind: CallKind,
}

/// Payload of `call-accepted`, `call-rejected` and `call-ended`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallUpdate {
    pub room_id: RoomId,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeUpdate {
    pub post_id: PostId,
    pub likes: Vec<UserId>,
}

/// Inbound channel events, validated at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    ReceiveMessage(ReceivedMessage),
    UserTyping(TypingNotice),
    UserStopTyping(TypingNotice),
    CallInitiated(CallInitiated),
    IncomingCall(IncomingCall),
    CallAccepted(CallUpdate),
    CallRejected(CallUpdate),
    CallEnded(CallUpdate),
    WebrtcSignal(SignalEnvelope),
    NewNotification(Notification),
    NewPost(Post),
    LikeUpdate(LikeUpdate),
    ConversationUpdated(Conversation),
    /// A known event whose payload failed validation.
    Malformed {
        kind: EventKind,
        error: ProtocolError,
    },
    Unknown {
        event: String,
    },
}

impl InboundEvent {
    pub fn kind(&self) -> Option<EventKind> {
        let kind = match self {
            Self::ReceiveMessage(_) => EventKind::ReceiveMessage,
            Self::UserTyping(_) => EventKind::UserTyping,
            Self::UserStopTyping(_) => EventKind::UserStopTyping,
            Self::CallInitiated(_) => EventKind::CallInitiated,
            Self::IncomingCall(_) => EventKind::IncomingCall,
            Self::CallAccepted(_) => EventKind::CallAccepted,
            Self::CallRejected(_) => EventKind::CallRejected,
            Self::CallEnded(_) => EventKind::CallEnded,
            Self::WebrtcSignal(_) => EventKind::WebrtcSignal,
            Self::NewNotification(_) => EventKind::NewNotification,
            Self::NewPost(_) => EventKind::NewPost,
            Self::LikeUpdate(_) => EventKind::LikeUpdate,
            Self::ConversationUpdated(_) => EventKind::ConversationUpdated,
            Self::Malformed { kind, .. } => *kind,
            Self::Unknown { .. } => return None,
        };
        Some(kind)
    }

    pub fn decode(event: &str, data: Value) -> Self {
        let Some(kind) = EventKind::from_name(event) else {
            return Self::Unknown {
                event: event.to_owned(),
            };
        };

        let decoded = match kind {
            EventKind::ReceiveMessage => decode_received_message(data).map(Self::ReceiveMessage),
            EventKind::UserTyping => payload(kind, data).map(Self::UserTyping),
            EventKind::UserStopTyping => payload(kind, data).map(Self::UserStopTyping),
            EventKind::CallInitiated => payload::<CallInitiated>(kind, data)
                .and_then(|p| require_room(kind, &p.room_id).map(|_| p))
                .map(Self::CallInitiated),
            EventKind::IncomingCall => payload::<IncomingCall>(kind, data)
                .and_then(|p| require_room(kind, &p.room_id).map(|_| p))
                .map(Self::IncomingCall),
            EventKind::CallAccepted => decode_call_update(kind, data).map(Self::CallAccepted),
            EventKind::CallRejected => decode_call_update(kind, data).map(Self::CallRejected),
            EventKind::CallEnded => decode_call_update(kind, data).map(Self::CallEnded),
            EventKind::WebrtcSignal => decode_signal(data).map(Self::WebrtcSignal),
            EventKind::NewNotification => payload(kind, data).map(Self::NewNotification),
            EventKind::NewPost => payload(kind, data).map(Self::NewPost),
            EventKind::LikeUpdate => payload(kind, data).map(Self::LikeUpdate),
            EventKind::ConversationUpdated => {
                decode_conversation(data).map(Self::ConversationUpdated)
            }
        };

        decoded.unwrap_or_else(|error| Self::Malformed { kind, error })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HandshakeError {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

impl HandshakeError {
    pub fn is_auth_failure(&self) -> bool {
        if let Some(code) = &self.code {
            return matches!(code.as_str(), "unauthorized" | "forbidden" | "auth");
        }
        let message = self.message.to_ascii_lowercase();
        message.contains("auth") || message.contains("token")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Accepted,
    Rejected(HandshakeError),
}

/// One decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Handshake(Handshake),
    Ack { id: u64, payload: Value },
    Event(InboundEvent),
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    ack: Option<u64>,
}

pub fn decode_frame(text: &str) -> Result<ServerFrame, ProtocolError> {
    let raw: RawFrame =
        serde_json::from_str(text).map_err(|err| ProtocolError::InvalidJson(err.to_string()))?;

    match raw.event.as_str() {
        CONNECT_EVENT => Ok(ServerFrame::Handshake(Handshake::Accepted)),
        CONNECT_ERROR_EVENT => {
            let error = match raw.data {
                Value::String(message) => HandshakeError {
                    message,
                    code: None,
                },
                other => serde_json::from_value(other).unwrap_or(HandshakeError {
                    message: "connection rejected".to_owned(),
                    code: None,
                }),
            };
            Ok(ServerFrame::Handshake(Handshake::Rejected(error)))
        }
        ACK_EVENT => match raw.ack {
            Some(id) => Ok(ServerFrame::Ack {
                id,
                payload: raw.data,
            }),
            None => Err(ProtocolError::MissingField {
                event: ACK_EVENT,
                field: "ack",
            }),
        },
        event => Ok(ServerFrame::Event(InboundEvent::decode(event, raw.data))),
    }
}

/// Acknowledgement payload for `send_message`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct SendAck {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "messageId")]
    pub message_id: Option<MessageId>,
    #[serde(default)]
    pub message: Option<AckedMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AckedMessage {
    #[serde(rename = "_id")]
    pub id: MessageId,
    #[serde(default, rename = "createdAt")]
    pub created_at: Option<DateTime<Utc>>,
}

impl SendAck {
    pub fn parse(payload: Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(payload).map_err(|err| ProtocolError::InvalidPayload {
            event: "send_message",
            reason: err.to_string(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }

    pub fn server_id(&self) -> Option<&MessageId> {
        self.message_id
            .as_ref()
            .or(self.message.as_ref().map(|m| &m.id))
            .filter(|id| !id.as_str().is_empty())
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.message.as_ref().and_then(|m| m.created_at)
    }
}

fn payload<T: DeserializeOwned>(kind: EventKind, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|err| ProtocolError::InvalidPayload {
        event: kind.as_str(),
        reason: err.to_string(),
    })
}

fn require_room(kind: EventKind, room_id: &RoomId) -> Result<(), ProtocolError> {
    if room_id.as_str().is_empty() {
        return Err(ProtocolError::MissingField {
            event: kind.as_str(),
            field: "roomId",
        });
    }
    Ok(())
}

#[derive(Deserialize)]
struct RawSender {
    #[serde(default, rename = "_id")]
    id: Option<UserId>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConversationRef {
    Id(ConversationId),
    Populated {
        #[serde(rename = "_id")]
        id: ConversationId,
    },
}

#[derive(Deserialize)]
struct RawReceivedMessage {
    #[serde(default, rename = "_id")]
    id: Option<MessageId>,
    #[serde(default)]
    sender: Option<RawSender>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, rename = "createdAt")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    conversation: Option<ConversationRef>,
}

fn decode_received_message(data: Value) -> Result<ReceivedMessage, ProtocolError> {
    const EVENT: &str = "receive_message";
    let raw: RawReceivedMessage = payload(EventKind::ReceiveMessage, data)?;

    let id = raw
        .id
        .filter(|id| !id.as_str().is_empty())
        .ok_or(ProtocolError::MissingField {
            event: EVENT,
            field: "_id",
        })?;
    let sender_id = raw
        .sender
        .and_then(|s| s.id)
        .filter(|id| !id.as_str().is_empty())
        .ok_or(ProtocolError::MissingField {
            event: EVENT,
            field: "sender._id",
        })?;
    let content = raw
        .content
        .filter(|c| !c.is_empty())
        .ok_or(ProtocolError::MissingField {
            event: EVENT,
            field: "content",
        })?;
    let conversation_id = match raw.conversation {
        Some(ConversationRef::Id(id)) | Some(ConversationRef::Populated { id }) => id,
        None => {
            return Err(ProtocolError::MissingField {
                event: EVENT,
                field: "conversation",
            })
        }
    };

    Ok(ReceivedMessage {
        id,
        sender_id,
        content,
        created_at: raw.created_at,
        conversation_id,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCallUpdate {
    Bare(RoomId),
    Full {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        #[serde(default)]
        reason: Option<String>,
    },
}

fn decode_call_update(kind: EventKind, data: Value) -> Result<CallUpdate, ProtocolError> {
    let update = match payload::<RawCallUpdate>(kind, data)? {
        RawCallUpdate::Bare(room_id) => CallUpdate {
            room_id,
            reason: None,
        },
        RawCallUpdate::Full { room_id, reason } => CallUpdate { room_id, reason },
    };
    require_room(kind, &update.room_id)?;
    Ok(update)
}

fn decode_signal(data: Value) -> Result<SignalEnvelope, ProtocolError> {
    let envelope: SignalEnvelope = payload(EventKind::WebrtcSignal, data)?;
    require_room(EventKind::WebrtcSignal, &envelope.room_id)?;
    if envelope.signal.is_null() {
        return Err(ProtocolError::MissingField {
            event: EventKind::WebrtcSignal.as_str(),
            field: "signal",
        });
    }
    Ok(envelope)
}

fn decode_conversation(data: Value) -> Result<Conversation, ProtocolError> {
    let conversation: Conversation = payload(EventKind::ConversationUpdated, data)?;
    if conversation.participants.len() < 2 {
        return Err(ProtocolError::InvalidPayload {
            event: EventKind::ConversationUpdated.as_str(),
            reason: format!(
                "conversation {} has {} participant(s), expected at least 2",
                conversation.id,
                conversation.participants.len()
            ),
        });
    }
    Ok(conversation)
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
