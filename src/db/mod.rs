pub mod conversation_repository;
pub mod memory_store;
pub mod message_repository;

use async_trait::async_trait;

use crate::errors::AppError;
use crate::models::{Conversation, Message};

use self::conversation_repository::ConversationRepository;
use self::message_repository::MessageRepository;

pub use self::memory_store::InMemoryConversationStore;

/// Durable mapping from conversation id to its ordered message history.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(&self, conversation: &Conversation) -> Result<(), AppError>;

    async fn exists(&self, id: &str) -> Result<bool, AppError>;

    /// Full history in append order. Unknown ids yield `UnknownConversation`.
    async fn load_history(&self, id: &str) -> Result<Vec<Message>, AppError>;

    async fn append(&self, message: &Message) -> Result<(), AppError>;

    /// Most recently updated first.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError>;
}

/// Postgres-backed store built from the two repositories.
#[derive(Clone)]
pub struct PgConversationStore {
    conversations: ConversationRepository,
    messages: MessageRepository,
}

impl PgConversationStore {
    pub fn new(conversations: ConversationRepository, messages: MessageRepository) -> Self {
        Self { conversations, messages }
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn create(&self, conversation: &Conversation) -> Result<(), AppError> {
        self.conversations.save(conversation).await
    }

    async fn exists(&self, id: &str) -> Result<bool, AppError> {
        self.conversations.exists(id).await
    }

    async fn load_history(&self, id: &str) -> Result<Vec<Message>, AppError> {
        if !self.conversations.exists(id).await? {
            return Err(AppError::UnknownConversation { id: id.to_string() });
        }
        self.messages.find_by_conversation_id(id).await
    }

    async fn append(&self, message: &Message) -> Result<(), AppError> {
        self.messages.save(message).await?;
        self.conversations.update_timestamp(&message.conversation_id).await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        self.conversations.find_all().await
    }
}
