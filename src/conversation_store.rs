//! `ConversationStore` contract and an in-memory illustrative
//! implementation.
//!
//! Persistence is scoped to the interface only; the in-memory map here is
//! the minimal working implementation needed to exercise it in tests
//! (default-no-op trait, trivial concrete impl).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::BoxError;
use crate::tool::{ToolCall, ToolOutput};

#[derive(Debug, Clone)]
pub struct Turn {
    pub role: String,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub tool_outputs: Vec<ToolOutput>,
    pub response_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub agent_id: Option<String>,
    pub turns: Vec<Turn>,
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Conversation { id: id.into(), agent_id: None, turns: Vec::new(), metadata: HashMap::new(), created_at: now, updated_at: now }
    }
}

#[derive(Debug)]
pub struct NotFound(pub String);

impl std::fmt::Display for NotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conversation not found: {}", self.0)
    }
}
impl std::error::Error for NotFound {}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn save(&self, conversation: Conversation) -> Result<(), BoxError>;
    async fn load(&self, id: &str) -> Result<Conversation, BoxError>;
    async fn append(&self, id: &str, turn: Turn) -> Result<(), BoxError>;
    async fn delete(&self, id: &str) -> Result<(), BoxError>;
}

#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn save(&self, conversation: Conversation) -> Result<(), BoxError> {
        self.conversations.lock().unwrap().insert(conversation.id.clone(), conversation);
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Conversation, BoxError> {
        self.conversations
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Box::new(NotFound(id.to_string())) as BoxError)
    }

    async fn append(&self, id: &str, turn: Turn) -> Result<(), BoxError> {
        let mut conversations = self.conversations.lock().unwrap();
        let conversation = conversations.entry(id.to_string()).or_insert_with(|| Conversation::new(id));
        conversation.turns.push(turn);
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), BoxError> {
        self.conversations.lock().unwrap().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_creates_then_accumulates_turns() {
        let store = InMemoryConversationStore::new();
        store
            .append(
                "conv-1",
                Turn { role: "user".into(), content: "hi".into(), tool_calls: vec![], tool_outputs: vec![], response_id: None, timestamp: Utc::now() },
            )
            .await
            .unwrap();
        let conversation = store.load("conv-1").await.unwrap();
        assert_eq!(conversation.turns.len(), 1);
    }

    #[tokio::test]
    async fn load_missing_conversation_is_distinguished_not_found() {
        let store = InMemoryConversationStore::new();
        let err = store.load("missing").await.unwrap_err();
        assert!(err.downcast_ref::<NotFound>().is_some());
    }
}
