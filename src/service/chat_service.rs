use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::ConversationStore;
use crate::errors::AppError;
use crate::models::{Conversation, Message};
use crate::service::turn_engine::{TurnEngine, TurnEvent};

const MAX_MESSAGE_LENGTH: usize = 8000;

/// A started turn: the id to announce (only for new conversations) and the
/// live event sequence.
pub struct ChatTurn {
    pub conversation_id: String,
    pub is_new: bool,
    pub events: mpsc::Receiver<TurnEvent>,
}

/// Holds a conversation's single-writer slot until dropped.
pub struct TurnGuard {
    id: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.id);
        }
    }
}

#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn ConversationStore>,
    engine: Arc<TurnEngine>,
    active_turns: Arc<Mutex<HashSet<String>>>,
}

impl ChatService {
    pub fn new(store: Arc<dyn ConversationStore>, engine: Arc<TurnEngine>) -> Self {
        Self { store, engine, active_turns: Arc::new(Mutex::new(HashSet::new())) }
    }

    pub async fn get_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        self.store.list_conversations().await
    }

    pub async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        self.store.load_history(conversation_id).await
    }

    /// Maps an optional caller-supplied id to `(id, is_new)`.
    /// Unknown ids are rejected rather than silently starting over.
    pub async fn resolve(&self, conversation_id: Option<String>) -> Result<(String, bool), AppError> {
        let Some(id) = conversation_id else {
            return Ok((Uuid::new_v4().to_string(), true));
        };
        if self.store.exists(&id).await? {
            Ok((id, false))
        } else {
            Err(AppError::UnknownConversation { id })
        }
    }

    /// Validates the message, resolves the conversation, persists the user
    /// message and starts the turn. Errors here happen before any frame is
    /// written.
    pub async fn start_turn(
        &self,
        message: &str,
        conversation_id: Option<String>,
    ) -> Result<ChatTurn, AppError> {
        // ── Validation ────────────────────────────────────────────────────────
        if message.trim().is_empty() {
            return Err(AppError::EmptyField { field_name: "message".to_string() });
        }
        if message.len() > MAX_MESSAGE_LENGTH {
            return Err(AppError::FieldTooLong {
                field_name: "message".to_string(),
                max_length: MAX_MESSAGE_LENGTH,
                actual_length: message.len(),
            });
        }

        // ── Resolve or create conversation ────────────────────────────────────
        let (conversation_id, is_new) = self.resolve(conversation_id).await?;
        let guard = self.acquire(&conversation_id)?;

        if is_new {
            let conversation =
                Conversation::new(conversation_id.clone(), Conversation::title_from(message));
            self.store.create(&conversation).await?;
            info!("Created conversation {conversation_id}");
        }

        // ── Persist user message and load the full history ────────────────────
        self.store.append(&Message::user(&conversation_id, message)).await?;
        let history = self.store.load_history(&conversation_id).await?;
        debug!("Starting turn for {conversation_id} with {} messages", history.len());

        let events = self.engine.start(conversation_id.clone(), history, guard);
        Ok(ChatTurn { conversation_id, is_new, events })
    }

    fn acquire(&self, conversation_id: &str) -> Result<TurnGuard, AppError> {
        let mut active = self
            .active_turns
            .lock()
            .map_err(|_| AppError::Unexpected("turn registry poisoned".to_string()))?;
        if !active.insert(conversation_id.to_string()) {
            return Err(AppError::ConversationBusy { id: conversation_id.to_string() });
        }
        Ok(TurnGuard { id: conversation_id.to_string(), active: Arc::clone(&self.active_turns) })
    }
}
