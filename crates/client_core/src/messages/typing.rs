use std::{collections::HashMap, time::Duration};

use shared::{
    domain::{ConversationId, UserId},
    protocol::OutboundEvent,
};
use tokio::time::Instant;

/// Remote users currently typing, per conversation, with expiry.
#[derive(Debug)]
pub struct TypingState {
    expiry: Duration,
    members: HashMap<ConversationId, HashMap<UserId, Instant>>,
}

impl TypingState {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            members: HashMap::new(),
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Returns `true` when the visible set changed.
    pub fn start(&mut self, conversation_id: &ConversationId, user_id: &UserId, now: Instant) -> bool {
        let members = self.members.entry(conversation_id.clone()).or_default();
        let was_visible = members
            .get(user_id)
            .is_some_and(|deadline| *deadline > now);
        members.insert(user_id.clone(), now + self.expiry);
        !was_visible
    }

    pub fn stop(&mut self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        let Some(members) = self.members.get_mut(conversation_id) else {
            return false;
        };
        let removed = members.remove(user_id).is_some();
        if members.is_empty() {
            self.members.remove(conversation_id);
        }
        removed
    }

    /// Drop expired entries. Returns `true` when any were removed.
    pub fn prune(&mut self, conversation_id: &ConversationId, now: Instant) -> bool {
        let Some(members) = self.members.get_mut(conversation_id) else {
            return false;
        };
        let before = members.len();
        members.retain(|_, deadline| *deadline > now);
        let changed = members.len() != before;
        if members.is_empty() {
            self.members.remove(conversation_id);
        }
        changed
    }

    pub fn users(&self, conversation_id: &ConversationId, now: Instant) -> Vec<UserId> {
        let mut users: Vec<_> = self
            .members
            .get(conversation_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, deadline)| **deadline > now)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default();
        users.sort();
        users
    }

    pub fn clear(&mut self, conversation_id: &ConversationId) -> bool {
        self.members.remove(conversation_id).is_some()
    }

    pub fn clear_all(&mut self) -> Vec<ConversationId> {
        self.members.drain().map(|(id, _)| id).collect()
    }
}

/// The local user's typing announcements.
#[derive(Debug, Default)]
pub struct LocalTyping {
    active: Option<ConversationId>,
    generation: u64,
}

impl LocalTyping {
    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    /// Apply an input change. Returns the events to emit and the generation a
    /// trailing debounce must present to [`LocalTyping::debounce_elapsed`].
    pub fn input(&mut self, conversation_id: &ConversationId, text: &str) -> (Vec<OutboundEvent>, u64) {
        let mut events = Vec::new();
        if self.active.as_ref().is_some_and(|active| active != conversation_id) {
            if let Some(previous) = self.active.take() {
                events.push(OutboundEvent::StopTyping(previous));
            }
        }
        if self.active.is_none() && !text.trim().is_empty() {
            events.push(OutboundEvent::Typing(conversation_id.clone()));
            self.active = Some(conversation_id.clone());
        }
        self.generation += 1;
        (events, self.generation)
    }

    pub fn debounce_elapsed(&mut self, generation: u64) -> Option<OutboundEvent> {
        if generation != self.generation {
            return None;
        }
        self.active.take().map(OutboundEvent::StopTyping)
    }

    pub fn stop(&mut self) -> Option<OutboundEvent> {
        self.generation += 1;
        self.active.take().map(OutboundEvent::StopTyping)
    }
}
