use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const TITLE_MAX_CHARS: usize = 60;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: String, title: String) -> Self {
        let now = Utc::now();
        Self { id, title, created_at: now, updated_at: now }
    }

    /// Derives a sidebar title from the first user message.
    pub fn title_from(message: &str) -> String {
        let t = message.trim();
        if t.chars().count() > TITLE_MAX_CHARS {
            format!("{}…", t.chars().take(TITLE_MAX_CHARS).collect::<String>())
        } else {
            t.to_string()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "USER",
            MessageRole::Assistant => "ASSISTANT",
            MessageRole::Tool => "TOOL",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for MessageRole {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "USER" => Ok(MessageRole::User),
            "ASSISTANT" => Ok(MessageRole::Assistant),
            "TOOL" => Ok(MessageRole::Tool),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

/// A tool invocation requested by the model. Never user-supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    /// Tool calls recorded on an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// On a tool message, the id of the originating call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(conversation_id: String, role: MessageRole, content: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id,
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            created_at: Utc::now(),
        }
    }

    pub fn user(conversation_id: &str, content: impl Into<String>) -> Self {
        Self::new(conversation_id.to_string(), MessageRole::User, content.into())
    }

    pub fn assistant(
        conversation_id: &str,
        content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            tool_calls,
            ..Self::new(conversation_id.to_string(), MessageRole::Assistant, content.into())
        }
    }

    pub fn tool_result(conversation_id: &str, call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call.id.clone()),
            tool_name: Some(call.name.clone()),
            ..Self::new(conversation_id.to_string(), MessageRole::Tool, content.into())
        }
    }
}

/// Query string of `GET /chat_stream/{message}`.
#[derive(Debug, Default, Deserialize)]
pub struct ChatStreamQuery {
    pub checkpoint_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub search_key_configured: bool,
    pub model_key_configured: bool,
}

/// One outbound frame of the chat event stream.
///
/// Serialized as `{"type": "<snake_case variant>", ...fields}`. The set of
/// variants is closed: clients must treat any other tag as a protocol error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Checkpoint { checkpoint_id: String },
    Content { content: String },
    SearchStart { query: String },
    SearchResults { urls: Vec<String> },
    Error { message: String },
    End,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error { .. } | StreamEvent::End)
    }

    pub fn to_json(&self) -> String {
        // A closed enum of strings cannot fail to serialize.
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","message":"serialization failed"}"#.to_string())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("frame is missing the 'data:' prefix")]
    MissingDataPrefix,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Parses one `data: <JSON>` line of the event stream.
pub fn parse_frame(line: &str) -> Result<StreamEvent, ProtocolError> {
    let payload = line
        .trim_end_matches(['\r', '\n'])
        .strip_prefix("data:")
        .ok_or(ProtocolError::MissingDataPrefix)?;
    parse_payload(payload.trim_start())
}

/// Parses the JSON payload of a frame whose `data:` prefix is already stripped.
pub fn parse_payload(payload: &str) -> Result<StreamEvent, ProtocolError> {
    serde_json::from_str(payload).map_err(|e| ProtocolError::Malformed(e.to_string()))
}
