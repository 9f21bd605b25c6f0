//! One signed-in realtime session: the channel, the engines around it and the
//! shared `ClientEvent` stream.

use std::sync::{Arc, Weak};

use peer_integration::{MediaDevices, PeerConnector};
use shared::{
    domain::{ConnectionState, UserId},
    error::{ErrorKind, RealtimeError},
    protocol::{NotificationRequest, OutboundEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    call::CallController,
    channel::{ChannelError, ChannelSignal, EventChannel},
    dispatcher::{EventDispatcher, FeedCache, NotificationCache},
    messages::{ConversationDirectory, MessageSyncEngine},
    settings::ClientSettings,
    transport::ChannelTransport,
    ClientEvent,
};

const EVENT_CAPACITY: usize = 256;

/// Platform seams and caches a session is built around.
pub struct SessionDependencies {
    pub transport: Arc<dyn ChannelTransport>,
    pub directory: Arc<dyn ConversationDirectory>,
    pub media: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnector>,
    pub feed: Option<Arc<dyn FeedCache>>,
    pub notifications: Option<Arc<dyn NotificationCache>>,
}

pub struct RealtimeSession {
    user_id: UserId,
    channel: Arc<EventChannel>,
    messages: Arc<MessageSyncEngine>,
    calls: Arc<CallController>,
    dispatcher: Arc<EventDispatcher>,
    events: broadcast::Sender<ClientEvent>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeSession {
    pub fn new(
        settings: &ClientSettings,
        user_id: UserId,
        dependencies: SessionDependencies,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let channel = EventChannel::new(
            user_id.clone(),
            settings.channel(),
            dependencies.transport,
        );
        let messages = MessageSyncEngine::new(
            channel.clone(),
            dependencies.directory,
            settings.messages(),
            events.clone(),
        );
        let calls = CallController::new(
            channel.clone(),
            dependencies.media,
            dependencies.peers,
            settings.calls(),
            events.clone(),
        );

        let mut dispatcher =
            EventDispatcher::new(channel.clone(), events.clone()).with_conversations(messages.clone());
        if let Some(feed) = dependencies.feed {
            dispatcher = dispatcher.with_feed(feed);
        }
        if let Some(notifications) = dependencies.notifications {
            dispatcher = dispatcher.with_notifications(notifications);
        }

        Arc::new(Self {
            user_id,
            channel,
            messages,
            calls,
            dispatcher: Arc::new(dispatcher),
            events,
            supervisor: Mutex::new(None),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn channel(&self) -> &Arc<EventChannel> {
        &self.channel
    }

    pub fn messages(&self) -> &Arc<MessageSyncEngine> {
        &self.messages
    }

    pub fn calls(&self) -> &Arc<CallController> {
        &self.calls
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.connection_state()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Connect, start every engine and load the conversation list.
    pub async fn open(self: &Arc<Self>, token: &str) -> Result<(), ChannelError> {
        let signals = self.channel.signals();
        let supervisor = tokio::spawn(supervise(Arc::downgrade(self), signals));
        if let Some(previous) = self.supervisor.lock().await.replace(supervisor) {
            previous.abort();
        }

        self.messages.start().await;
        self.calls.start().await;
        self.dispatcher.start().await;

        self.channel.connect(token).await?;
        info!(user_id = %self.user_id, "session: opened");
        self.spawn_resync();
        Ok(())
    }

    fn spawn_resync(&self) {
        let messages = self.messages.clone();
        tokio::spawn(async move {
            if let Err(err) = messages.resync().await {
                debug!(error = %err, "session: resync did not complete");
            }
        });
    }

    /// Relay a like/comment/follow notification to its receiver.
    pub fn send_notification(&self, request: NotificationRequest) -> Result<(), ChannelError> {
        self.channel.emit(OutboundEvent::SendNotification(request))
    }

    async fn teardown(&self) {
        self.messages.shutdown().await;
        self.calls.shutdown().await;
        self.dispatcher.stop().await;
        self.channel.close();
    }

    pub async fn close(&self) {
        if let Some(supervisor) = self.supervisor.lock().await.take() {
            supervisor.abort();
        }
        self.teardown().await;
        info!(user_id = %self.user_id, "session: closed");
    }
}

/// Forward lifecycle signals and react to the ones that need session work.
async fn supervise(session: Weak<RealtimeSession>, mut signals: broadcast::Receiver<ChannelSignal>) {
    loop {
        let signal = match signals.recv().await {
            Ok(signal) => signal,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "session: lifecycle signals lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(session) = session.upgrade() else {
            return;
        };
        session.publish(ClientEvent::Connection(signal.clone()));
        match signal {
            ChannelSignal::ConnectionRestored => {
                info!("session: connection restored, resyncing");
                session.spawn_resync();
            }
            ChannelSignal::ConnectionDegraded { missed } => {
                session.publish(ClientEvent::Error(RealtimeError::new(
                    ErrorKind::ConnectionDegraded,
                    format!("{missed} heartbeats unanswered"),
                )));
            }
            ChannelSignal::AuthRejected { message } => {
                warn!(%message, "session: credentials rejected, signing out");
                session.teardown().await;
                session.publish(ClientEvent::SignedOut);
                return;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
