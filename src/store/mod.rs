//! Conversation persistence seam.
//!
//! The database layer is an external collaborator; the runtime only needs
//! these four operations. The in-memory implementation backs tests and
//! single-pod development deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

// ── Messages ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// One conversation turn. Non-user messages default to full confidence.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    /// Retained when a message is corrected in place.
    pub original_content: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// 0–100. Transcription confidence for user turns.
    pub confidence: u8,
}

impl ConversationMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            original_content: None,
            timestamp: Utc::now(),
            confidence: 100,
        }
    }

    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence = confidence.min(100);
        self
    }
}

/// A recorded tool invocation on a conversation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ActionRecord {
    pub name: String,
    pub arguments: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

// ── Store trait ────────────────────────────────────────────────────

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create the conversation row if it does not exist yet; returns its id.
    /// Calling again with the same call id returns the same id.
    async fn ensure_conversation(
        &self,
        tenant_id: &str,
        agent_id: &str,
        channel: &str,
        call_id: &str,
    ) -> anyhow::Result<String>;

    async fn append_message(
        &self,
        conversation_id: &str,
        message: &ConversationMessage,
    ) -> anyhow::Result<()>;

    /// Replace a message's content, retaining the original.
    async fn update_message(
        &self,
        conversation_id: &str,
        message_id: Uuid,
        content: &str,
    ) -> anyhow::Result<()>;

    async fn mark_ended(&self, conversation_id: &str) -> anyhow::Result<()>;
}

// ── In-memory implementation ───────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct StoredConversation {
    pub tenant_id: String,
    pub agent_id: String,
    pub channel: String,
    pub call_id: String,
    pub messages: Vec<ConversationMessage>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Number of `mark_ended` writes, for idempotence assertions.
    pub ended_writes: u32,
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, StoredConversation>,
    by_call: HashMap<String, String>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, conversation_id: &str) -> Option<StoredConversation> {
        self.inner.lock().conversations.get(conversation_id).cloned()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn ensure_conversation(
        &self,
        tenant_id: &str,
        agent_id: &str,
        channel: &str,
        call_id: &str,
    ) -> anyhow::Result<String> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.by_call.get(call_id) {
            return Ok(existing.clone());
        }
        let id = Uuid::new_v4().to_string();
        inner.conversations.insert(
            id.clone(),
            StoredConversation {
                tenant_id: tenant_id.to_owned(),
                agent_id: agent_id.to_owned(),
                channel: channel.to_owned(),
                call_id: call_id.to_owned(),
                ..Default::default()
            },
        );
        inner.by_call.insert(call_id.to_owned(), id.clone());
        Ok(id)
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        message: &ConversationMessage,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| anyhow::anyhow!("conversation not found: {conversation_id}"))?;
        if conversation.ended_at.is_some() {
            anyhow::bail!("conversation already ended: {conversation_id}");
        }
        conversation.messages.push(message.clone());
        Ok(())
    }

    async fn update_message(
        &self,
        conversation_id: &str,
        message_id: Uuid,
        content: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| anyhow::anyhow!("conversation not found: {conversation_id}"))?;
        let message = conversation
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| anyhow::anyhow!("message not found: {message_id}"))?;
        if message.original_content.is_none() {
            message.original_content = Some(std::mem::take(&mut message.content));
        }
        message.content = content.to_owned();
        Ok(())
    }

    async fn mark_ended(&self, conversation_id: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| anyhow::anyhow!("conversation not found: {conversation_id}"))?;
        conversation.ended_writes += 1;
        if conversation.ended_at.is_none() {
            conversation.ended_at = Some(Utc::now());
        }
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_is_idempotent_per_call() {
        let store = InMemoryConversationStore::new();
        let a = store
            .ensure_conversation("T1", "A1", "whatsapp", "C1")
            .await
            .unwrap();
        let b = store
            .ensure_conversation("T1", "A1", "whatsapp", "C1")
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn append_and_end() {
        let store = InMemoryConversationStore::new();
        let id = store
            .ensure_conversation("T1", "A1", "web", "C2")
            .await
            .unwrap();
        store
            .append_message(&id, &ConversationMessage::new(MessageRole::User, "hi"))
            .await
            .unwrap();
        store.mark_ended(&id).await.unwrap();

        let stored = store.get(&id).unwrap();
        assert_eq!(stored.messages.len(), 1);
        assert!(stored.ended_at.is_some());

        // Appends after the end are rejected.
        let err = store
            .append_message(&id, &ConversationMessage::new(MessageRole::User, "late"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already ended"));
    }

    #[tokio::test]
    async fn update_retains_original_content() {
        let store = InMemoryConversationStore::new();
        let id = store
            .ensure_conversation("T1", "A1", "web", "C3")
            .await
            .unwrap();
        let message = ConversationMessage::new(MessageRole::User, "helo").with_confidence(60);
        store.append_message(&id, &message).await.unwrap();

        store.update_message(&id, message.id, "hello").await.unwrap();
        // A second correction keeps the very first content.
        store.update_message(&id, message.id, "hello!").await.unwrap();

        let stored = store.get(&id).unwrap();
        assert_eq!(stored.messages[0].content, "hello!");
        assert_eq!(stored.messages[0].original_content.as_deref(), Some("helo"));
        assert_eq!(stored.messages[0].confidence, 60);
    }

    #[test]
    fn non_user_confidence_defaults_to_full() {
        let message = ConversationMessage::new(MessageRole::Assistant, "hi");
        assert_eq!(message.confidence, 100);
    }
}
