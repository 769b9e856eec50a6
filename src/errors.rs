use thiserror::Error;

/// Top-level application error.
/// All variants carry a human-readable message for display/logging.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Database errors ──────────────────────────────────────────────────────
    #[error("Database query failed: {message}")]
    DatabaseQueryFailed {
        message: String,
        #[source]
        source: sqlx::Error,
    },

    // ── Model errors ─────────────────────────────────────────────────────────
    #[error("Model invocation failed: {message}")]
    ModelInvocation { message: String },

    // ── Tool errors ──────────────────────────────────────────────────────────
    #[error("Tool '{tool_name}' failed: {message}")]
    ToolInvocation { tool_name: String, message: String },

    #[error("Model requested unknown tool '{tool_name}'")]
    UnknownToolRequested { tool_name: String },

    #[error("Tool call limit of {max_rounds} rounds exceeded")]
    ToolRoundLimitExceeded { max_rounds: usize },

    // ── Validation errors ────────────────────────────────────────────────────
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    #[error("Field '{field_name}' exceeds max length of {max_length} (actual: {actual_length})")]
    FieldTooLong { field_name: String, max_length: usize, actual_length: usize },

    // ── Conversation errors ──────────────────────────────────────────────────
    #[error("Conversation '{id}' not found")]
    UnknownConversation { id: String },

    #[error("Conversation '{id}' already has a turn in progress")]
    ConversationBusy { id: String },

    #[error("Request limit reached: at most {limit} requests per {window_secs}s are allowed")]
    RateLimited { limit: u32, window_secs: u64 },

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn db_query(message: impl Into<String>, source: sqlx::Error) -> Self {
        AppError::DatabaseQueryFailed { message: message.into(), source }
    }

    pub fn model(message: impl Into<String>) -> Self {
        AppError::ModelInvocation { message: message.into() }
    }

    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::ToolInvocation { tool_name: tool_name.into(), message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::UnknownConversation { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AppError::EmptyField { .. } | AppError::FieldTooLong { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::ConversationBusy { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AppError::RateLimited { .. })
    }
}
