use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::{
    domain::{
        Conversation, ConversationId, Message, MessageId, MessageKey, MessagePreview, ReadState,
        TempId, UserId,
    },
    protocol::ReceivedMessage,
};

/// Result of applying a send acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The pending entry now carries the server id.
    Confirmed(Message),
    /// The server echo got there first; the pending entry was dropped.
    MergedWithEcho(Message),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    RolledBack { conversation_id: ConversationId },
    /// An echo already confirmed this send, so it stays.
    AlreadyConfirmed(Message),
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Appended to the open conversation's thread.
    Appended(Message),
    /// Our own echo, matched to the pending entry it confirms.
    EchoConfirmed { temp_id: TempId, message: Message },
    /// Only the conversation summary changed.
    Summarised { unread: u32 },
    Duplicate,
    UnknownConversation,
}

/// Conversations and message threads owned by the sync engine.
pub struct MessageStore {
    self_id: UserId,
    conversations: HashMap<ConversationId, Conversation>,
    threads: HashMap<ConversationId, Vec<Message>>,
    open: Option<ConversationId>,
    pending: HashMap<TempId, ConversationId>,
    echoed: HashMap<TempId, (ConversationId, MessageId)>,
    /// Unread inbound messages that arrived while their conversation was
    /// open and so never entered `unread_count`.
    uncounted: HashSet<MessageId>,
    next_temp: u64,
}

impl MessageStore {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            conversations: HashMap::new(),
            threads: HashMap::new(),
            open: None,
            pending: HashMap::new(),
            echoed: HashMap::new(),
            uncounted: HashSet::new(),
            next_temp: 0,
        }
    }

    pub fn open_conversation(&self) -> Option<&ConversationId> {
        self.open.as_ref()
    }

    pub fn set_open(&mut self, conversation_id: Option<ConversationId>) {
        self.open = conversation_id;
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> &[Message] {
        self.threads
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(conversation_id)
    }

    /// Newest activity first.
    pub fn conversations_by_recency(&self) -> Vec<Conversation> {
        let mut list: Vec<_> = self.conversations.values().cloned().collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        list
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn begin_send(
        &mut self,
        conversation_id: &ConversationId,
        content: &str,
        now: DateTime<Utc>,
    ) -> (TempId, Message) {
        self.next_temp += 1;
        let temp_id = TempId(self.next_temp);
        let message = Message {
            key: MessageKey::Pending(temp_id),
            conversation_id: conversation_id.clone(),
            sender_id: self.self_id.clone(),
            content: content.to_owned(),
            created_at: now,
            read_state: ReadState::Read,
        };
        self.threads
            .entry(conversation_id.clone())
            .or_default()
            .push(message.clone());
        self.pending.insert(temp_id, conversation_id.clone());
        (temp_id, message)
    }

    pub fn confirm_send(
        &mut self,
        temp_id: TempId,
        server_id: MessageId,
        created_at: Option<DateTime<Utc>>,
    ) -> ConfirmOutcome {
        if let Some(message) = self.take_echoed(temp_id) {
            return ConfirmOutcome::MergedWithEcho(message);
        }
        let Some(conversation_id) = self.pending.remove(&temp_id) else {
            return ConfirmOutcome::Unknown;
        };
        let thread = self.threads.entry(conversation_id.clone()).or_default();
        let Some(index) = thread
            .iter()
            .position(|m| m.key == MessageKey::Pending(temp_id))
        else {
            return ConfirmOutcome::Unknown;
        };

        if let Some(echo) = thread
            .iter()
            .find(|m| m.server_id() == Some(&server_id))
            .cloned()
        {
            thread.remove(index);
            return ConfirmOutcome::MergedWithEcho(echo);
        }

        let message = &mut thread[index];
        message.key = MessageKey::Confirmed(server_id);
        if let Some(created_at) = created_at {
            message.created_at = created_at;
        }
        let confirmed = message.clone();
        self.touch_summary(&confirmed);
        ConfirmOutcome::Confirmed(confirmed)
    }

    pub fn rollback_send(&mut self, temp_id: TempId) -> RollbackOutcome {
        if let Some(message) = self.take_echoed(temp_id) {
            return RollbackOutcome::AlreadyConfirmed(message);
        }
        let Some(conversation_id) = self.pending.remove(&temp_id) else {
            return RollbackOutcome::Unknown;
        };
        if let Some(thread) = self.threads.get_mut(&conversation_id) {
            thread.retain(|m| m.key != MessageKey::Pending(temp_id));
        }
        RollbackOutcome::RolledBack { conversation_id }
    }

    fn take_echoed(&mut self, temp_id: TempId) -> Option<Message> {
        let (conversation_id, server_id) = self.echoed.remove(&temp_id)?;
        self.threads
            .get(&conversation_id)
            .and_then(|thread| thread.iter().find(|m| m.server_id() == Some(&server_id)))
            .cloned()
    }

    pub fn apply_inbound(&mut self, received: ReceivedMessage, now: DateTime<Utc>) -> InboundOutcome {
        let conversation_id = received.conversation_id;
        let from_self = received.sender_id == self.self_id;
        let message = Message {
            key: MessageKey::Confirmed(received.id.clone()),
            conversation_id: conversation_id.clone(),
            sender_id: received.sender_id,
            content: received.content,
            created_at: received.created_at.unwrap_or(now),
            read_state: if from_self {
                ReadState::Read
            } else {
                ReadState::Unread
            },
        };

        if self.is_known_message(&conversation_id, &received.id) {
            return InboundOutcome::Duplicate;
        }

        if from_self {
            if let Some(temp_id) = self.adopt_echo(&message) {
                self.touch_summary(&message);
                return InboundOutcome::EchoConfirmed { temp_id, message };
            }
        }

        let known = self.touch_summary(&message);
        if self.open.as_ref() == Some(&conversation_id) {
            if !from_self {
                self.uncounted.insert(received.id);
            }
            self.threads
                .entry(conversation_id)
                .or_default()
                .push(message.clone());
            return InboundOutcome::Appended(message);
        }
        if !known {
            return InboundOutcome::UnknownConversation;
        }

        let Some(conversation) = self.conversations.get_mut(&conversation_id) else {
            return InboundOutcome::UnknownConversation;
        };
        if !from_self {
            conversation.unread_count = conversation.unread_count.saturating_add(1);
        }
        InboundOutcome::Summarised {
            unread: conversation.unread_count,
        }
    }

    fn is_known_message(&self, conversation_id: &ConversationId, id: &MessageId) -> bool {
        let in_thread = self
            .threads
            .get(conversation_id)
            .is_some_and(|thread| thread.iter().any(|m| m.server_id() == Some(id)));
        let is_last = self
            .conversations
            .get(conversation_id)
            .and_then(|c| c.last_message.as_ref())
            .and_then(|preview| preview.id.as_ref())
            == Some(id);
        in_thread || is_last
    }

    /// Rewrite the oldest matching pending entry with the echoed server id.
    fn adopt_echo(&mut self, echo: &Message) -> Option<TempId> {
        let thread = self.threads.get_mut(&echo.conversation_id)?;
        let slot = thread.iter_mut().find(|m| {
            matches!(m.key, MessageKey::Pending(temp) if self.pending.contains_key(&temp))
                && m.content == echo.content
        })?;
        let MessageKey::Pending(temp_id) = slot.key else {
            return None;
        };
        let server_id = echo.server_id()?.clone();
        slot.key = MessageKey::Confirmed(server_id.clone());
        slot.created_at = echo.created_at;
        self.pending.remove(&temp_id);
        self.echoed
            .insert(temp_id, (echo.conversation_id.clone(), server_id));
        Some(temp_id)
    }

    /// Returns `false` when the conversation is not cached.
    fn touch_summary(&mut self, message: &Message) -> bool {
        let Some(conversation) = self.conversations.get_mut(&message.conversation_id) else {
            return false;
        };
        conversation.last_message = Some(MessagePreview::from(message));
        if message.created_at > conversation.updated_at {
            conversation.updated_at = message.created_at;
        }
        true
    }

    /// Mark one inbound message read. Returns `false` when nothing changed.
    pub fn mark_read(&mut self, conversation_id: &ConversationId, message_id: &MessageId) -> bool {
        let Some(message) = self.threads.get_mut(conversation_id).and_then(|thread| {
            thread
                .iter_mut()
                .find(|m| m.server_id() == Some(message_id))
        }) else {
            return false;
        };
        if message.sender_id == self.self_id || message.read_state == ReadState::Read {
            return false;
        }
        message.read_state = ReadState::Read;
        if self.uncounted.remove(message_id) {
            return true;
        }
        if let Some(conversation) = self.conversations.get_mut(conversation_id) {
            conversation.unread_count = conversation.unread_count.saturating_sub(1);
        }
        true
    }

    /// Ids of unread inbound messages in a thread, oldest first.
    pub fn unread_ids(&self, conversation_id: &ConversationId) -> Vec<MessageId> {
        self.messages(conversation_id)
            .iter()
            .filter(|m| m.read_state == ReadState::Unread && m.sender_id != self.self_id)
            .filter_map(|m| m.server_id().cloned())
            .collect()
    }

    pub fn upsert_conversation(&mut self, conversation: Conversation) -> bool {
        match self.conversations.get(&conversation.id) {
            Some(existing) if *existing == conversation => false,
            _ => {
                self.conversations
                    .insert(conversation.id.clone(), conversation);
                true
            }
        }
    }

    pub fn replace_conversations(&mut self, list: Vec<Conversation>) {
        self.conversations = list
            .into_iter()
            .map(|conversation| (conversation.id.clone(), conversation))
            .collect();
    }

    /// Merge fetched history by server id. Locally confirmed entries the
    /// server has not returned yet stay, and pending entries stay at the tail.
    pub fn merge_history(&mut self, conversation_id: &ConversationId, history: Vec<Message>) {
        let existing = self.threads.remove(conversation_id).unwrap_or_default();
        let mut seen = HashSet::new();
        let mut merged = Vec::with_capacity(history.len() + existing.len());

        for message in history {
            if let Some(id) = message.server_id() {
                if seen.insert(id.clone()) {
                    merged.push(message);
                }
            }
        }
        let (pending, confirmed): (Vec<_>, Vec<_>) =
            existing.into_iter().partition(Message::is_pending);
        for message in confirmed {
            if let Some(id) = message.server_id() {
                if seen.insert(id.clone()) {
                    merged.push(message);
                }
            }
        }
        merged.extend(pending);
        self.threads.insert(conversation_id.clone(), merged);
    }
}

#[cfg(test)]
#[path = "../tests/message_store_tests.rs"]
mod tests;
