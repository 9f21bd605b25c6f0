//! Client-side realtime session: event channel, chat sync, call negotiation
//! and cache fan-in for the social app backend.

pub mod call;
pub mod channel;
pub mod dispatcher;
pub mod messages;
pub mod retry;
pub mod session;
pub mod settings;
pub mod transport;

use shared::{
    domain::{ConversationId, Message, MessageId, Notification, PostId, TempId, UserId},
    error::RealtimeError,
};

pub use call::{CallController, CallError, CallEvent, CallPhase, CallSettings, EndReason};
pub use channel::{ChannelError, ChannelSettings, ChannelSignal, EventChannel, SubscriberScope};
pub use dispatcher::{
    ConversationCache, EventDispatcher, FeedCache, MemoryFeed, MemoryNotifications,
    NotificationCache,
};
pub use messages::{
    ConversationDirectory, HttpConversationDirectory, MessageSettings, MessageSyncEngine,
    SendError,
};
pub use session::{RealtimeSession, SessionDependencies};
pub use settings::{load_settings, ClientSettings};
pub use transport::{ChannelTransport, WebSocketTransport};

/// Everything a UI layer observes, on one broadcast stream per session.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connection(ChannelSignal),
    MessagePending {
        conversation_id: ConversationId,
        temp_id: TempId,
    },
    MessageConfirmed {
        conversation_id: ConversationId,
        temp_id: TempId,
        message_id: MessageId,
    },
    MessageRolledBack {
        conversation_id: ConversationId,
        temp_id: TempId,
        error: RealtimeError,
    },
    MessageReceived(Message),
    HistoryLoaded {
        conversation_id: ConversationId,
    },
    ConversationUpdated {
        conversation_id: ConversationId,
    },
    ConversationsReloaded,
    TypingChanged {
        conversation_id: ConversationId,
        users: Vec<UserId>,
    },
    Call(CallEvent),
    PostAdded(PostId),
    PostLikesUpdated {
        post_id: PostId,
        likes: Vec<UserId>,
    },
    NotificationReceived(Notification),
    /// Credentials were rejected; the session has been torn down.
    SignedOut,
    Error(RealtimeError),
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
