//! Language-model capability.
//!
//! [`ChatModel`] is the seam the turn engine talks to: give it the history and
//! the tool schemas, get back a lazy stream of text fragments and tool calls.
//! [`RigChatModel`] implements it over any rig-core completion model.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use rig::client::Nothing;
use rig::completion::{CompletionModel, ToolDefinition as RigToolDefinition};
use rig::message::{
    AssistantContent, Message as RigMessage, ToolResultContent, UserContent,
};
use rig::one_or_many::OneOrMany;
use rig::prelude::CompletionClient;
use rig::providers::{groq, ollama};
use rig::streaming::StreamedAssistantContent;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::{AppConfig, ModelProvider};
use crate::errors::AppError;
use crate::models::{Message, MessageRole, ToolCall};
use crate::tools::ToolDefinition;

const PREAMBLE: &str = "You are a helpful assistant with access to a web search tool. \
                        Use web_search for recent events, live data, or anything you are unsure of. \
                        Answer concisely and accurately. If you don't know something, say so.";

/// One unit of model output.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    Text(String),
    ToolCall(ToolCall),
}

pub type ModelStream = BoxStream<'static, Result<ModelChunk, AppError>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Starts one completion over `history`. Text fragments are yielded as
    /// they arrive; tool calls are yielded after the last fragment.
    async fn stream(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ModelStream, AppError>;
}

/// Builds the configured provider's model.
pub fn build_model(config: &AppConfig) -> Result<Arc<dyn ChatModel>, AppError> {
    match config.provider {
        ModelProvider::Ollama => {
            let client: ollama::Client = ollama::Client::builder()
                .api_key(Nothing)
                .base_url(&config.ollama_base_url)
                .build()
                .map_err(|e| AppError::Configuration(format!("Failed to build Ollama client: {e}")))?;
            Ok(Arc::new(RigChatModel::new(
                client.completion_model(config.model_name.as_str()),
                &config.ollama_base_url,
            )))
        }
        ModelProvider::Groq => {
            let key = config.groq_api_key.as_deref().ok_or_else(|| {
                AppError::Configuration("GROQ_API_KEY not found in environment variables".into())
            })?;
            let client: groq::Client = groq::Client::builder()
                .api_key(key)
                .build()
                .map_err(|e| AppError::Configuration(format!("Failed to build Groq client: {e}")))?;
            Ok(Arc::new(RigChatModel::new(
                client.completion_model(config.model_name.as_str()),
                "api.groq.com",
            )))
        }
    }
}

/// Adapts a rig [`CompletionModel`] to [`ChatModel`].
/// History is replayed in full on every call; the model keeps no state.
pub struct RigChatModel<M> {
    model: M,
    host: String,
}

impl<M: CompletionModel> RigChatModel<M> {
    pub fn new(model: M, host: &str) -> Self {
        Self { model, host: host.to_string() }
    }

    fn classify(&self, e: impl std::fmt::Display) -> AppError {
        let msg = e.to_string();
        error!("Model inference failed: {msg}");
        if msg.contains("Connection refused") || msg.contains("connect") {
            AppError::model(format!("model service unavailable at {}", self.host))
        } else {
            AppError::model(msg)
        }
    }
}

#[async_trait]
impl<M> ChatModel for RigChatModel<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    async fn stream(
        &self,
        history: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ModelStream, AppError> {
        let mut rig_history = to_rig_history(history)?;
        let prompt = rig_history
            .pop()
            .ok_or_else(|| AppError::model("cannot run a completion over an empty history"))?;
        let rig_tools = tools
            .iter()
            .map(|t| RigToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            })
            .collect::<Vec<_>>();

        let request = self
            .model
            .completion_request(prompt)
            .preamble(PREAMBLE.to_string())
            .messages(rig_history)
            .tools(rig_tools)
            .build();

        debug!("Starting model stream over {} messages", history.len());
        let response = self.model.stream(request).await.map_err(|e| self.classify(e))?;

        // Text is forwarded delta by delta. Tool calls are read from the
        // aggregated choice once the provider stream is exhausted.
        let state = (Box::pin(response), VecDeque::new(), false);
        let chunks = stream::unfold(state, |(mut response, mut pending, mut done)| async move {
            loop {
                if let Some(chunk) = pending.pop_front() {
                    return Some((Ok(chunk), (response, pending, done)));
                }
                if done {
                    return None;
                }
                match response.next().await {
                    Some(Ok(StreamedAssistantContent::Text(text))) => {
                        return Some((Ok(ModelChunk::Text(text.text)), (response, pending, done)));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Some((Err(AppError::model(e.to_string())), (response, pending, true)));
                    }
                    None => {
                        done = true;
                        pending.extend(response.choice.iter().filter_map(|content| match content {
                            AssistantContent::ToolCall(call) => Some(ModelChunk::ToolCall(ToolCall {
                                id: call.id.clone(),
                                name: call.function.name.clone(),
                                arguments: call.function.arguments.clone(),
                            })),
                            _ => None,
                        }));
                    }
                }
            }
        });
        Ok(chunks.boxed())
    }
}

/// Converts stored history to rig messages. Tool results travel as user
/// content, which is how rig models the tool role. Calls left without a
/// result by an aborted turn are dropped so providers accept the replay.
fn to_rig_history(messages: &[Message]) -> Result<Vec<RigMessage>, AppError> {
    let answered: HashSet<&str> = messages
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();

    messages
        .iter()
        .filter_map(|m| match m.role {
            MessageRole::User => Some(Ok(RigMessage::user(&m.content))),
            MessageRole::Assistant => {
                let calls: Vec<&ToolCall> = m
                    .tool_calls
                    .iter()
                    .filter(|call| answered.contains(call.id.as_str()))
                    .collect();
                if calls.is_empty() {
                    return (!m.content.is_empty() || m.tool_calls.is_empty())
                        .then(|| Ok(RigMessage::assistant(&m.content)));
                }
                let mut content = Vec::with_capacity(calls.len() + 1);
                if !m.content.is_empty() {
                    content.push(AssistantContent::text(&m.content));
                }
                content.extend(calls.into_iter().map(|call| {
                    AssistantContent::tool_call(&call.id, &call.name, call.arguments.clone())
                }));
                Some(
                    OneOrMany::many(content)
                        .map(|content| RigMessage::Assistant { id: None, content })
                        .map_err(|e| AppError::Unexpected(format!("Empty assistant message: {e}"))),
                )
            }
            MessageRole::Tool => Some(
                m.tool_call_id
                    .clone()
                    .ok_or_else(|| AppError::Unexpected(format!("Tool message {} has no call id", m.id)))
                    .map(|call_id| RigMessage::User {
                        content: OneOrMany::one(UserContent::tool_result(
                            call_id,
                            OneOrMany::one(ToolResultContent::text(&m.content)),
                        )),
                    }),
            ),
        })
        .collect()
}
