use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use shared::domain::{
    Conversation, ConversationId, Message, MessageId, MessageKey, ReadState, UserRef,
};
use tracing::warn;

/// Read access to conversation summaries and history over the REST API.
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>>;
    async fn fetch_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>>;
}

pub struct HttpConversationDirectory {
    http: Client,
    api_url: String,
    token: String,
}

impl HttpConversationDirectory {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_owned(),
            token: token.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryMessage {
    #[serde(rename = "_id")]
    id: MessageId,
    sender: UserRef,
    #[serde(default)]
    content: String,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
    #[serde(default)]
    read: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryResponse {
    Bare(Vec<HistoryMessage>),
    Wrapped { messages: Vec<HistoryMessage> },
}

impl HistoryResponse {
    fn into_messages(self, conversation_id: &ConversationId) -> Vec<Message> {
        let raw = match self {
            Self::Bare(messages) | Self::Wrapped { messages } => messages,
        };
        raw.into_iter()
            .filter(|m| !m.id.as_str().is_empty())
            .map(|m| Message {
                key: MessageKey::Confirmed(m.id),
                conversation_id: conversation_id.clone(),
                sender_id: m.sender.id().clone(),
                content: m.content,
                created_at: m.created_at,
                read_state: if m.read {
                    ReadState::Read
                } else {
                    ReadState::Unread
                },
            })
            .collect()
    }
}

#[async_trait]
impl ConversationDirectory for HttpConversationDirectory {
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>> {
        let conversations: Vec<Conversation> = self
            .http
            .get(format!("{}/chat/conversations", self.api_url))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(conversations
            .into_iter()
            .filter(|c| {
                let valid = c.participants.len() >= 2;
                if !valid {
                    warn!(conversation_id = %c.id, "directory: skipping conversation with fewer than two participants");
                }
                valid
            })
            .collect())
    }

    async fn fetch_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let response: HistoryResponse = self
            .http
            .get(format!(
                "{}/chat/conversations/{}",
                self.api_url, conversation_id
            ))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.into_messages(conversation_id))
    }
}
