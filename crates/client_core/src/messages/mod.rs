//! Optimistic chat state, typing indicators and read receipts.

mod directory;
mod store;
mod typing;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{Conversation, ConversationId, Message, MessageId, TempId, UserId},
    error::{ErrorKind, RealtimeError},
    protocol::{EventKind, InboundEvent, OutboundEvent, ReadReceipt, SendAck, SendMessagePayload, TypingNotice},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{sleep, Instant},
};
use tracing::{debug, info, warn};

pub use directory::{ConversationDirectory, HttpConversationDirectory};
pub use store::{ConfirmOutcome, InboundOutcome, MessageStore, RollbackOutcome};
pub use typing::{LocalTyping, TypingState};

use crate::{
    channel::{ChannelError, EventChannel},
    dispatcher::ConversationCache,
    ClientEvent,
};

#[derive(Debug, Clone)]
pub struct MessageSettings {
    pub ack_timeout: Duration,
    pub typing_debounce: Duration,
    pub typing_grace: Duration,
}

impl Default for MessageSettings {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(10),
            typing_debounce: Duration::from_secs(2),
            typing_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("message content is empty")]
    EmptyContent,
    #[error("not connected; retry once the connection is restored")]
    Disconnected,
    #[error("message was not delivered: {0}")]
    Failed(String),
}

impl SendError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::EmptyContent)
    }
}

impl From<&SendError> for RealtimeError {
    fn from(value: &SendError) -> Self {
        let kind = match value {
            SendError::EmptyContent => ErrorKind::InvalidState,
            SendError::Disconnected => ErrorKind::Transport,
            SendError::Failed(_) => ErrorKind::SendFailed,
        };
        RealtimeError::new(kind, value.to_string())
    }
}

struct SyncState {
    store: MessageStore,
    typing: TypingState,
    local_typing: LocalTyping,
    debounce: Option<JoinHandle<()>>,
    expiry_timers: HashMap<(ConversationId, UserId), JoinHandle<()>>,
}

impl SyncState {
    fn cancel_expiry_timers(&mut self, conversation_id: &ConversationId) {
        self.expiry_timers.retain(|(conversation, _), timer| {
            if conversation == conversation_id {
                timer.abort();
                false
            } else {
                true
            }
        });
    }

    fn stop_local_typing(&mut self) -> Option<OutboundEvent> {
        if let Some(debounce) = self.debounce.take() {
            debounce.abort();
        }
        self.local_typing.stop()
    }
}

pub struct MessageSyncEngine {
    channel: Arc<EventChannel>,
    directory: Arc<dyn ConversationDirectory>,
    settings: MessageSettings,
    events: broadcast::Sender<ClientEvent>,
    inner: Mutex<SyncState>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MessageSyncEngine {
    pub fn new(
        channel: Arc<EventChannel>,
        directory: Arc<dyn ConversationDirectory>,
        settings: MessageSettings,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        let self_id = channel.user_id().clone();
        let expiry = settings.typing_debounce + settings.typing_grace;
        Arc::new(Self {
            channel,
            directory,
            settings,
            events,
            inner: Mutex::new(SyncState {
                store: MessageStore::new(self_id),
                typing: TypingState::new(expiry),
                local_typing: LocalTyping::default(),
                debounce: None,
                expiry_timers: HashMap::new(),
            }),
            pump: Mutex::new(None),
        })
    }

    /// Subscribe to chat events and start draining them.
    pub async fn start(self: &Arc<Self>) {
        let mut scope = self.channel.scope("messages");
        scope.on_all(&[
            EventKind::ReceiveMessage,
            EventKind::UserTyping,
            EventKind::UserStopTyping,
        ]);

        let engine = Arc::downgrade(self);
        let pump = tokio::spawn(async move {
            while let Some(event) = scope.recv().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.handle_event(event).await;
            }
        });
        if let Some(previous) = self.pump.lock().await.replace(pump) {
            previous.abort();
        }
    }

    fn publish(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Emit outside the state lock's critical section; chat emissions are
    /// best-effort.
    fn emit_quietly(&self, event: OutboundEvent) {
        let name = event.name();
        if let Err(err) = self.channel.emit(event) {
            debug!(event = name, error = %err, "messages: emit skipped");
        }
    }

    pub async fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.inner
            .lock()
            .await
            .store
            .messages(conversation_id)
            .to_vec()
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.inner.lock().await.store.conversations_by_recency()
    }

    pub async fn conversation(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        self.inner
            .lock()
            .await
            .store
            .conversation(conversation_id)
            .cloned()
    }

    pub async fn open_conversation_id(&self) -> Option<ConversationId> {
        self.inner.lock().await.store.open_conversation().cloned()
    }

    pub async fn typing_users(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        self.inner
            .lock()
            .await
            .typing
            .users(conversation_id, Instant::now())
    }

    /// Make `conversation_id` the open conversation and load its history.
    pub async fn open_conversation(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
    ) -> anyhow::Result<()> {
        self.switch_conversation(Some(conversation_id.clone())).await;
        self.load_history(conversation_id).await
    }

    pub async fn close_conversation(self: &Arc<Self>) {
        self.switch_conversation(None).await;
    }

    async fn switch_conversation(&self, next: Option<ConversationId>) {
        let (stop, cleared) = {
            let mut inner = self.inner.lock().await;
            let stop = inner.stop_local_typing();
            let previous = inner.store.open_conversation().cloned();
            let mut cleared = None;
            if let Some(previous) = previous.filter(|p| Some(p) != next.as_ref()) {
                inner.cancel_expiry_timers(&previous);
                if inner.typing.clear(&previous) {
                    cleared = Some(previous);
                }
            }
            inner.store.set_open(next.clone());
            (stop, cleared)
        };
        if let Some(stop) = stop {
            self.emit_quietly(stop);
        }
        if let Some(conversation_id) = cleared {
            self.publish(ClientEvent::TypingChanged {
                conversation_id,
                users: Vec::new(),
            });
        }
        if let Some(conversation_id) = next {
            info!(%conversation_id, "messages: conversation opened");
        }
    }

    async fn load_history(&self, conversation_id: &ConversationId) -> anyhow::Result<()> {
        let history = match self.directory.fetch_messages(conversation_id).await {
            Ok(history) => history,
            Err(err) => {
                warn!(%conversation_id, error = %err, "messages: history fetch failed");
                self.publish(ClientEvent::Error(RealtimeError::new(
                    ErrorKind::Transport,
                    format!("failed to load conversation {conversation_id}: {err:#}"),
                )));
                return Err(err);
            }
        };
        {
            let mut inner = self.inner.lock().await;
            if inner.store.open_conversation() != Some(conversation_id) {
                debug!(%conversation_id, "messages: history arrived after switching away");
                return Ok(());
            }
            inner.store.merge_history(conversation_id, history);
        }
        self.publish(ClientEvent::HistoryLoaded {
            conversation_id: conversation_id.clone(),
        });
        Ok(())
    }

    /// Send optimistically; the returned message carries the server id.
    ///
    /// The pending entry is resolved on a spawned task, so it is confirmed or
    /// rolled back even when the caller stops awaiting.
    pub async fn send(
        self: &Arc<Self>,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<Message, SendError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SendError::EmptyContent);
        }
        if !self.channel.is_connected() {
            return Err(SendError::Disconnected);
        }

        let (stop, temp_id) = {
            let mut inner = self.inner.lock().await;
            let stop = inner.stop_local_typing();
            let (temp_id, _) = inner.store.begin_send(conversation_id, content, Utc::now());
            (stop, temp_id)
        };
        if let Some(stop) = stop {
            self.emit_quietly(stop);
        }
        self.publish(ClientEvent::MessagePending {
            conversation_id: conversation_id.clone(),
            temp_id,
        });

        let engine = self.clone();
        let conversation_id = conversation_id.clone();
        let content = content.to_owned();
        tokio::spawn(async move { engine.deliver(&conversation_id, content, temp_id).await })
            .await
            .unwrap_or_else(|err| Err(SendError::Failed(format!("delivery task failed: {err}"))))
    }

    /// Await the ack for `temp_id` and confirm or roll back its entry.
    async fn deliver(
        &self,
        conversation_id: &ConversationId,
        content: String,
        temp_id: TempId,
    ) -> Result<Message, SendError> {
        let delivered = self
            .channel
            .emit_with_ack(
                OutboundEvent::SendMessage(SendMessagePayload {
                    content,
                    conversation: conversation_id.clone(),
                }),
                self.settings.ack_timeout,
            )
            .await
            .map_err(|err| SendError::Failed(describe_channel_error(&err)))
            .and_then(|payload| SendAck::parse(payload).map_err(|err| SendError::Failed(err.to_string())))
            .and_then(|ack| {
                if !ack.is_success() {
                    let reason = ack.error.unwrap_or_else(|| format!("server answered '{}'", ack.status));
                    return Err(SendError::Failed(reason));
                }
                match ack.server_id() {
                    Some(id) => Ok((id.clone(), ack.created_at())),
                    None => Err(SendError::Failed(
                        "acknowledgement carried no message id".into(),
                    )),
                }
            });

        match delivered {
            Ok((server_id, created_at)) => {
                let outcome = self
                    .inner
                    .lock()
                    .await
                    .store
                    .confirm_send(temp_id, server_id, created_at);
                match outcome {
                    ConfirmOutcome::Confirmed(message) | ConfirmOutcome::MergedWithEcho(message) => {
                        if let Some(message_id) = message.server_id().cloned() {
                            info!(%conversation_id, %temp_id, %message_id, "messages: send confirmed");
                            self.publish(ClientEvent::MessageConfirmed {
                                conversation_id: conversation_id.clone(),
                                temp_id,
                                message_id,
                            });
                        }
                        Ok(message)
                    }
                    ConfirmOutcome::Unknown => Err(SendError::Failed(
                        "pending message vanished before confirmation".into(),
                    )),
                }
            }
            Err(err) => {
                let outcome = self.inner.lock().await.store.rollback_send(temp_id);
                match outcome {
                    RollbackOutcome::AlreadyConfirmed(message) => Ok(message),
                    RollbackOutcome::RolledBack { .. } | RollbackOutcome::Unknown => {
                        warn!(%conversation_id, %temp_id, error = %err, "messages: send rolled back");
                        self.publish(ClientEvent::MessageRolledBack {
                            conversation_id: conversation_id.clone(),
                            temp_id,
                            error: RealtimeError::from(&err),
                        });
                        Err(err)
                    }
                }
            }
        }
    }

    /// Feed a composer change; emits `typing` once and arms the trailing stop.
    pub async fn input_changed(self: &Arc<Self>, conversation_id: &ConversationId, text: &str) {
        let events = {
            let mut inner = self.inner.lock().await;
            let (events, generation) = inner.local_typing.input(conversation_id, text);
            if let Some(debounce) = inner.debounce.take() {
                debounce.abort();
            }
            if inner.local_typing.active().is_some() {
                let engine = Arc::downgrade(self);
                let delay = self.settings.typing_debounce;
                inner.debounce = Some(tokio::spawn(async move {
                    sleep(delay).await;
                    if let Some(engine) = engine.upgrade() {
                        engine.finish_debounce(generation).await;
                    }
                }));
            }
            events
        };
        for event in events {
            self.emit_quietly(event);
        }
    }

    async fn finish_debounce(&self, generation: u64) {
        let stop = {
            let mut inner = self.inner.lock().await;
            let stop = inner.local_typing.debounce_elapsed(generation);
            if stop.is_some() {
                inner.debounce = None;
            }
            stop
        };
        if let Some(stop) = stop {
            self.emit_quietly(stop);
        }
    }

    pub async fn stop_typing(&self) {
        let stop = self.inner.lock().await.stop_local_typing();
        if let Some(stop) = stop {
            self.emit_quietly(stop);
        }
    }

    /// Mark an inbound message read and send the receipt. Repeats are no-ops.
    pub async fn mark_read(&self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        let changed = self
            .inner
            .lock()
            .await
            .store
            .mark_read(conversation_id, message_id);
        if !changed {
            return false;
        }
        self.emit_quietly(OutboundEvent::MarkMessageRead(ReadReceipt {
            message_id: message_id.clone(),
            conversation_id: conversation_id.clone(),
        }));
        self.publish(ClientEvent::ConversationUpdated {
            conversation_id: conversation_id.clone(),
        });
        true
    }

    /// Mark every unread inbound message of a conversation read.
    pub async fn mark_all_read(&self, conversation_id: &ConversationId) -> usize {
        let unread = self.inner.lock().await.store.unread_ids(conversation_id);
        let mut marked = 0;
        for message_id in unread {
            if self.mark_read(conversation_id, &message_id).await {
                marked += 1;
            }
        }
        marked
    }

    /// Re-fetch the conversation list and the open conversation's history.
    pub async fn resync(&self) -> anyhow::Result<()> {
        let conversations = match self.directory.fetch_conversations().await {
            Ok(conversations) => conversations,
            Err(err) => {
                warn!(error = %err, "messages: conversation resync failed");
                self.publish(ClientEvent::Error(RealtimeError::new(
                    ErrorKind::Transport,
                    format!("failed to refresh conversations: {err:#}"),
                )));
                return Err(err);
            }
        };
        let open = {
            let mut inner = self.inner.lock().await;
            inner.store.replace_conversations(conversations);
            inner.store.open_conversation().cloned()
        };
        info!(open = ?open, "messages: conversations resynced");
        self.publish(ClientEvent::ConversationsReloaded);
        if let Some(conversation_id) = open {
            self.load_history(&conversation_id).await?;
        }
        Ok(())
    }

    async fn handle_event(self: &Arc<Self>, event: InboundEvent) {
        match event {
            InboundEvent::ReceiveMessage(received) => {
                let sender = received.sender_id.clone();
                let conversation_id = received.conversation_id.clone();
                let (outcome, typing_cleared) = {
                    let mut inner = self.inner.lock().await;
                    let outcome = inner.store.apply_inbound(received, Utc::now());
                    let cleared = inner.typing.stop(&conversation_id, &sender);
                    if let Some(timer) = inner
                        .expiry_timers
                        .remove(&(conversation_id.clone(), sender.clone()))
                    {
                        timer.abort();
                    }
                    (outcome, cleared)
                };
                if typing_cleared {
                    self.publish_typing(&conversation_id).await;
                }
                match outcome {
                    InboundOutcome::Appended(message) => {
                        self.publish(ClientEvent::MessageReceived(message));
                    }
                    InboundOutcome::EchoConfirmed { temp_id, message } => {
                        if let Some(message_id) = message.server_id().cloned() {
                            self.publish(ClientEvent::MessageConfirmed {
                                conversation_id,
                                temp_id,
                                message_id,
                            });
                        }
                    }
                    InboundOutcome::Summarised { unread } => {
                        debug!(%conversation_id, unread, "messages: summary updated");
                        self.publish(ClientEvent::ConversationUpdated { conversation_id });
                    }
                    InboundOutcome::Duplicate => {
                        debug!(%conversation_id, "messages: duplicate message ignored");
                    }
                    InboundOutcome::UnknownConversation => {
                        debug!(%conversation_id, "messages: message for uncached conversation");
                    }
                }
            }
            InboundEvent::UserTyping(notice) => self.remote_typing_started(notice).await,
            InboundEvent::UserStopTyping(TypingNotice {
                conversation_id,
                user_id,
            }) => {
                let changed = {
                    let mut inner = self.inner.lock().await;
                    if let Some(timer) = inner
                        .expiry_timers
                        .remove(&(conversation_id.clone(), user_id.clone()))
                    {
                        timer.abort();
                    }
                    inner.typing.stop(&conversation_id, &user_id)
                };
                if changed {
                    self.publish_typing(&conversation_id).await;
                }
            }
            other => debug!(event = ?other.kind(), "messages: unexpected event"),
        }
    }

    async fn remote_typing_started(self: &Arc<Self>, notice: TypingNotice) {
        if &notice.user_id == self.channel.user_id() {
            return;
        }
        let TypingNotice {
            conversation_id,
            user_id,
        } = notice;
        let changed = {
            let mut inner = self.inner.lock().await;
            let changed = inner
                .typing
                .start(&conversation_id, &user_id, Instant::now());
            let expiry = inner.typing.expiry();
            let engine = Arc::downgrade(self);
            let timer_conversation = conversation_id.clone();
            let timer = tokio::spawn(async move {
                sleep(expiry).await;
                if let Some(engine) = engine.upgrade() {
                    engine.expire_typing(&timer_conversation).await;
                }
            });
            if let Some(previous) = inner
                .expiry_timers
                .insert((conversation_id.clone(), user_id), timer)
            {
                previous.abort();
            }
            changed
        };
        if changed {
            self.publish_typing(&conversation_id).await;
        }
    }

    async fn expire_typing(&self, conversation_id: &ConversationId) {
        let changed = self
            .inner
            .lock()
            .await
            .typing
            .prune(conversation_id, Instant::now());
        if changed {
            debug!(%conversation_id, "messages: typing indicator expired");
            self.publish_typing(conversation_id).await;
        }
    }

    async fn publish_typing(&self, conversation_id: &ConversationId) {
        let users = self.typing_users(conversation_id).await;
        self.publish(ClientEvent::TypingChanged {
            conversation_id: conversation_id.clone(),
            users,
        });
    }

    /// Cancel timers, announce a final `stop_typing` and stop the pump.
    pub async fn shutdown(&self) {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        let stop = {
            let mut inner = self.inner.lock().await;
            for (_, timer) in inner.expiry_timers.drain() {
                timer.abort();
            }
            inner.typing.clear_all();
            inner.stop_local_typing()
        };
        if let Some(stop) = stop {
            self.emit_quietly(stop);
        }
    }
}

fn describe_channel_error(err: &ChannelError) -> String {
    match err {
        ChannelError::AckTimeout { timeout, .. } => {
            format!("no acknowledgement within {timeout:?}")
        }
        other => other.to_string(),
    }
}

#[async_trait]
impl ConversationCache for MessageSyncEngine {
    async fn merge_conversation(&self, conversation: Conversation) -> bool {
        let conversation_id = conversation.id.clone();
        let changed = self
            .inner
            .lock()
            .await
            .store
            .upsert_conversation(conversation);
        if changed {
            self.publish(ClientEvent::ConversationUpdated { conversation_id });
        }
        changed
    }
}

#[cfg(test)]
#[path = "../tests/messages_tests.rs"]
mod tests;
