use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::ConversationStore;
use crate::errors::AppError;
use crate::models::{Conversation, Message};

struct Entry {
    conversation: Conversation,
    messages: Vec<Message>,
}

/// Process-local store used when no `DATABASE_URL` is configured.
/// History is lost on restart.
#[derive(Default)]
pub struct InMemoryConversationStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create(&self, conversation: &Conversation) -> Result<(), AppError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&conversation.id) {
            return Err(AppError::Unexpected(format!(
                "Conversation '{}' already exists",
                conversation.id
            )));
        }
        entries.insert(
            conversation.id.clone(),
            Entry { conversation: conversation.clone(), messages: Vec::new() },
        );
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool, AppError> {
        Ok(self.entries.read().await.contains_key(id))
    }

    async fn load_history(&self, id: &str) -> Result<Vec<Message>, AppError> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|entry| entry.messages.clone())
            .ok_or_else(|| AppError::UnknownConversation { id: id.to_string() })
    }

    async fn append(&self, message: &Message) -> Result<(), AppError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&message.conversation_id).ok_or_else(|| {
            AppError::UnknownConversation { id: message.conversation_id.clone() }
        })?;
        entry.messages.push(message.clone());
        entry.conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        let mut conversations: Vec<Conversation> = self
            .entries
            .read()
            .await
            .values()
            .map(|entry| entry.conversation.clone())
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_preserves_order() {
        let store = InMemoryConversationStore::new();
        store.create(&Conversation::new("c1".into(), "hello".into())).await.unwrap();
        store.append(&Message::user("c1", "first")).await.unwrap();
        store.append(&Message::assistant("c1", "second", vec![])).await.unwrap();

        let history = store.load_history("c1").await.unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["first", "second"]);
    }

    #[tokio::test]
    async fn unknown_conversation_is_reported() {
        let store = InMemoryConversationStore::new();
        assert!(!store.exists("nope").await.unwrap());
        assert!(store.load_history("nope").await.unwrap_err().is_not_found());
        assert!(store.append(&Message::user("nope", "x")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = InMemoryConversationStore::new();
        let conv = Conversation::new("c1".into(), "t".into());
        store.create(&conv).await.unwrap();
        assert!(store.create(&conv).await.is_err());
    }

    #[tokio::test]
    async fn list_is_most_recent_first() {
        let store = InMemoryConversationStore::new();
        store.create(&Conversation::new("old".into(), "old".into())).await.unwrap();
        store.create(&Conversation::new("new".into(), "new".into())).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.append(&Message::user("old", "bump")).await.unwrap();

        let ids: Vec<String> =
            store.list_conversations().await.unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, ["old", "new"]);
    }
}
