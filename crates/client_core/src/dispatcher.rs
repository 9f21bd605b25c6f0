//! Fan-in of feed, notification and conversation-summary events into caches.

use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{Conversation, Notification, NotificationId, Post, PostId, UserId},
    protocol::{EventKind, InboundEvent, LikeUpdate},
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{channel::EventChannel, ClientEvent};

#[async_trait]
pub trait FeedCache: Send + Sync {
    /// Returns `false` when the post was already cached.
    async fn add_post(&self, post: Post) -> bool;
    /// Replace the like list. Returns `false` for unknown or unchanged posts.
    async fn update_likes(&self, post_id: &PostId, likes: Vec<UserId>) -> bool;
}

#[async_trait]
pub trait NotificationCache: Send + Sync {
    /// Returns `false` when the notification was already cached.
    async fn add_notification(&self, notification: Notification) -> bool;
}

#[async_trait]
pub trait ConversationCache: Send + Sync {
    /// Insert or replace a conversation summary. Returns `true` on change.
    async fn merge_conversation(&self, conversation: Conversation) -> bool;
}

/// Newest-first post list.
#[derive(Default)]
pub struct MemoryFeed {
    posts: RwLock<Vec<Post>>,
}

impl MemoryFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn posts(&self) -> Vec<Post> {
        self.posts.read().await.clone()
    }

    pub async fn post(&self, post_id: &PostId) -> Option<Post> {
        self.posts
            .read()
            .await
            .iter()
            .find(|post| &post.id == post_id)
            .cloned()
    }
}

#[async_trait]
impl FeedCache for MemoryFeed {
    async fn add_post(&self, post: Post) -> bool {
        let mut posts = self.posts.write().await;
        if posts.iter().any(|existing| existing.id == post.id) {
            return false;
        }
        posts.insert(0, post);
        true
    }

    async fn update_likes(&self, post_id: &PostId, likes: Vec<UserId>) -> bool {
        let mut posts = self.posts.write().await;
        match posts.iter_mut().find(|post| &post.id == post_id) {
            Some(post) if post.likes != likes => {
                post.likes = likes;
                true
            }
            _ => false,
        }
    }
}

#[derive(Default)]
pub struct MemoryNotifications {
    items: RwLock<Vec<Notification>>,
}

impl MemoryNotifications {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.items.read().await.clone()
    }

    pub async fn unread_count(&self) -> usize {
        self.items.read().await.iter().filter(|n| !n.read).count()
    }

    pub async fn mark_read(&self, notification_id: &NotificationId) -> bool {
        let mut items = self.items.write().await;
        match items.iter_mut().find(|n| &n.id == notification_id) {
            Some(notification) if !notification.read => {
                notification.read = true;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl NotificationCache for MemoryNotifications {
    async fn add_notification(&self, notification: Notification) -> bool {
        let mut items = self.items.write().await;
        if items.iter().any(|existing| existing.id == notification.id) {
            return false;
        }
        items.insert(0, notification);
        true
    }
}

/// Routes fan-in events to whichever caches were registered. Event kinds
/// without a cache are never subscribed.
pub struct EventDispatcher {
    channel: Arc<EventChannel>,
    events: broadcast::Sender<ClientEvent>,
    feed: Option<Arc<dyn FeedCache>>,
    notifications: Option<Arc<dyn NotificationCache>>,
    conversations: Option<Arc<dyn ConversationCache>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    pub fn new(channel: Arc<EventChannel>, events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            channel,
            events,
            feed: None,
            notifications: None,
            conversations: None,
            pump: Mutex::new(None),
        }
    }

    pub fn with_feed(mut self, feed: Arc<dyn FeedCache>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn with_notifications(mut self, notifications: Arc<dyn NotificationCache>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    pub fn with_conversations(mut self, conversations: Arc<dyn ConversationCache>) -> Self {
        self.conversations = Some(conversations);
        self
    }

    pub fn registered_kinds(&self) -> Vec<EventKind> {
        let mut kinds = Vec::new();
        if self.feed.is_some() {
            kinds.extend([EventKind::NewPost, EventKind::LikeUpdate]);
        }
        if self.notifications.is_some() {
            kinds.push(EventKind::NewNotification);
        }
        if self.conversations.is_some() {
            kinds.push(EventKind::ConversationUpdated);
        }
        kinds
    }

    pub async fn start(self: &Arc<Self>) {
        let kinds = self.registered_kinds();
        if kinds.is_empty() {
            debug!("dispatcher: no caches registered");
            return;
        }
        let mut scope = self.channel.scope("dispatcher");
        scope.on_all(&kinds);
        info!(kinds = ?kinds, "dispatcher: started");

        let dispatcher = Arc::downgrade(self);
        let pump = tokio::spawn(async move {
            while let Some(event) = scope.recv().await {
                let Some(dispatcher) = dispatcher.upgrade() else {
                    break;
                };
                dispatcher.dispatch(event).await;
            }
        });
        if let Some(previous) = self.pump.lock().await.replace(pump) {
            previous.abort();
        }
    }

    fn publish(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Apply one event. Returns `true` when a cache changed.
    pub async fn dispatch(&self, event: InboundEvent) -> bool {
        match event {
            InboundEvent::NewPost(post) => {
                let Some(feed) = &self.feed else {
                    return false;
                };
                let post_id = post.id.clone();
                if !feed.add_post(post).await {
                    debug!(%post_id, "dispatcher: duplicate post ignored");
                    return false;
                }
                self.publish(ClientEvent::PostAdded(post_id));
                true
            }
            InboundEvent::LikeUpdate(LikeUpdate { post_id, likes }) => {
                let Some(feed) = &self.feed else {
                    return false;
                };
                if !feed.update_likes(&post_id, likes.clone()).await {
                    return false;
                }
                self.publish(ClientEvent::PostLikesUpdated { post_id, likes });
                true
            }
            InboundEvent::NewNotification(notification) => {
                let Some(cache) = &self.notifications else {
                    return false;
                };
                if notification.receiver.id() != self.channel.user_id() {
                    debug!(
                        notification_id = %notification.id,
                        receiver = %notification.receiver.id(),
                        "dispatcher: notification for another user ignored"
                    );
                    return false;
                }
                if !cache.add_notification(notification.clone()).await {
                    debug!(notification_id = %notification.id, "dispatcher: duplicate notification ignored");
                    return false;
                }
                self.publish(ClientEvent::NotificationReceived(notification));
                true
            }
            InboundEvent::ConversationUpdated(conversation) => match &self.conversations {
                Some(cache) => cache.merge_conversation(conversation).await,
                None => false,
            },
            other => {
                debug!(event = ?other.kind(), "dispatcher: unexpected event");
                false
            }
        }
    }

    pub async fn stop(&self) {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
