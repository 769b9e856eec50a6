//! Turn Engine: drives one user turn to completion.
//!
//! ```text
//!   AWAITING_MODEL ──(no tool calls)──▶ DONE
//!        ▲    │
//!        │    └──(tool calls)──▶ INVOKING_TOOLS
//!        └───────────────────────────────┘
//! ```
//!
//! Events are pushed into a bounded channel as they happen. A slow consumer
//! suspends the engine; a dropped consumer cancels it at the next await.

use std::future::Future;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{ChatModel, ModelChunk};
use crate::db::ConversationStore;
use crate::errors::AppError;
use crate::models::{Message, ToolCall};
use crate::tools::ToolGateway;

pub const EVENT_BUFFER: usize = 64;

/// Internal events of a turn, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Content(String),
    ToolStarted { query: String },
    ToolFinished { urls: Vec<String> },
    Completed,
    Failed(String),
}

/// Why a turn stopped early.
#[derive(Debug)]
enum Abort {
    Failed(AppError),
    Disconnected,
}

impl From<AppError> for Abort {
    fn from(e: AppError) -> Self {
        Abort::Failed(e)
    }
}

pub struct TurnEngine {
    model: Arc<dyn ChatModel>,
    tools: ToolGateway,
    store: Arc<dyn ConversationStore>,
    max_tool_rounds: usize,
}

impl TurnEngine {
    pub fn new(
        model: Arc<dyn ChatModel>,
        tools: ToolGateway,
        store: Arc<dyn ConversationStore>,
        max_tool_rounds: usize,
    ) -> Self {
        Self { model, tools, store, max_tool_rounds }
    }

    /// Runs a turn over `history` on a background task and returns the
    /// receiving end of its event sequence. `guard` is held until the turn
    /// finishes.
    pub fn start<G: Send + 'static>(
        self: &Arc<Self>,
        conversation_id: String,
        history: Vec<Message>,
        guard: G,
    ) -> mpsc::Receiver<TurnEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run(&conversation_id, history, tx, guard).await;
        });
        rx
    }

    /// Drives the turn and reports its outcome as the final event. `guard`
    /// is released before the final event so a client that saw it can
    /// immediately start the next turn.
    pub async fn run<G>(
        &self,
        conversation_id: &str,
        history: Vec<Message>,
        tx: mpsc::Sender<TurnEvent>,
        guard: G,
    ) {
        let outcome = self.drive(conversation_id, history, &tx).await;
        drop(guard);
        match outcome {
            Ok(()) => {
                info!("Turn completed for conversation {conversation_id}");
                let _ = tx.send(TurnEvent::Completed).await;
            }
            Err(Abort::Failed(e)) => {
                warn!("Turn failed for conversation {conversation_id}: {e}");
                let _ = tx.send(TurnEvent::Failed(e.to_string())).await;
            }
            Err(Abort::Disconnected) => {
                info!("Client disconnected; abandoning turn for conversation {conversation_id}");
            }
        }
    }

    async fn drive(
        &self,
        conversation_id: &str,
        mut history: Vec<Message>,
        tx: &mpsc::Sender<TurnEvent>,
    ) -> Result<(), Abort> {
        let mut rounds = 0;
        loop {
            // ── AWAITING_MODEL ────────────────────────────────────────────────
            let (text, calls) = self.await_model(&history, tx).await?;

            if calls.is_empty() {
                // ── DONE ──────────────────────────────────────────────────────
                let answer = Message::assistant(conversation_id, text, Vec::new());
                self.store.append(&answer).await?;
                return Ok(());
            }

            rounds += 1;
            if rounds > self.max_tool_rounds {
                return Err(AppError::ToolRoundLimitExceeded { max_rounds: self.max_tool_rounds }.into());
            }

            // ── INVOKING_TOOLS ────────────────────────────────────────────────
            let tools = calls
                .iter()
                .map(|call| self.tools.resolve(call))
                .collect::<Result<Vec<_>, _>>()?;

            let request = Message::assistant(conversation_id, text, calls.clone());
            self.store.append(&request).await?;
            history.push(request);

            for (call, tool) in calls.iter().zip(tools) {
                debug!("Round {rounds}: invoking {} ({})", call.name, call.id);
                emit(tx, TurnEvent::ToolStarted { query: tool.query(&call.arguments) }).await?;

                let output = until_closed(tx, tool.invoke(&call.arguments)).await??;

                emit(tx, TurnEvent::ToolFinished { urls: output.urls }).await?;

                let result = Message::tool_result(conversation_id, call, output.content);
                self.store.append(&result).await?;
                history.push(result);
            }
        }
    }

    /// Streams one completion, forwarding text as it arrives. Returns the
    /// accumulated text and any tool calls requested.
    async fn await_model(
        &self,
        history: &[Message],
        tx: &mpsc::Sender<TurnEvent>,
    ) -> Result<(String, Vec<ToolCall>), Abort> {
        let definitions = self.tools.definitions();
        let mut stream = until_closed(tx, self.model.stream(history, &definitions)).await??;

        let mut text = String::new();
        let mut calls = Vec::new();
        while let Some(chunk) = until_closed(tx, stream.next()).await? {
            match chunk? {
                ModelChunk::Text(fragment) if fragment.is_empty() => {}
                ModelChunk::Text(fragment) => {
                    text.push_str(&fragment);
                    emit(tx, TurnEvent::Content(fragment)).await?;
                }
                ModelChunk::ToolCall(mut call) => {
                    // Some providers omit call ids; results must still reference one.
                    if call.id.is_empty() {
                        call.id = format!("call_{}", Uuid::new_v4().simple());
                    }
                    calls.push(call);
                }
            }
        }
        Ok((text, calls))
    }
}

async fn emit(tx: &mpsc::Sender<TurnEvent>, event: TurnEvent) -> Result<(), Abort> {
    tx.send(event).await.map_err(|_| Abort::Disconnected)
}

/// Awaits `fut` unless the consumer goes away first.
async fn until_closed<F: Future>(tx: &mpsc::Sender<TurnEvent>, fut: F) -> Result<F::Output, Abort> {
    tokio::select! {
        _ = tx.closed() => Err(Abort::Disconnected),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::agent::testing::{search_call, MockChatModel};
    use crate::db::InMemoryConversationStore;
    use crate::models::{Conversation, MessageRole};
    use crate::tools::web_search::testing::MockSearchProvider;
    use crate::tools::web_search::WebSearchTool;

    struct Harness {
        engine: Arc<TurnEngine>,
        model: Arc<MockChatModel>,
        search: Arc<MockSearchProvider>,
        store: Arc<InMemoryConversationStore>,
    }

    async fn harness(model: MockChatModel, search: MockSearchProvider, max_rounds: usize) -> Harness {
        let model = Arc::new(model);
        let search = Arc::new(search);
        let store = Arc::new(InMemoryConversationStore::new());
        store.create(&Conversation::new("c1".into(), "t".into())).await.unwrap();
        let tools = ToolGateway::new().register(Arc::new(WebSearchTool::new(search.clone(), 4)));
        let engine = Arc::new(TurnEngine::new(model.clone(), tools, store.clone(), max_rounds));
        Harness { engine, model, search, store }
    }

    async fn run_to_end(h: &Harness, user: &str) -> Vec<TurnEvent> {
        let question = Message::user("c1", user);
        h.store.append(&question).await.unwrap();
        let history = h.store.load_history("c1").await.unwrap();
        let mut rx = h.engine.start("c1".into(), history, ());
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn plain_answer_streams_fragments_then_completes() {
        let h = harness(
            MockChatModel::new().then_text(&["Paris is ", "the capital ", "of France."]),
            MockSearchProvider::default(),
            5,
        )
        .await;

        let events = run_to_end(&h, "What is the capital of France?").await;
        assert_eq!(
            events,
            vec![
                TurnEvent::Content("Paris is ".into()),
                TurnEvent::Content("the capital ".into()),
                TurnEvent::Content("of France.".into()),
                TurnEvent::Completed,
            ]
        );

        let history = h.store.load_history("c1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, MessageRole::Assistant);
        assert_eq!(history[1].content, "Paris is the capital of France.");
    }

    #[tokio::test]
    async fn tool_round_feeds_results_back_to_the_model() {
        let h = harness(
            MockChatModel::new()
                .then_tool_calls(&[], vec![search_call("call_1", "Tokyo weather")])
                .then_text(&["It is sunny ", "in Tokyo."]),
            MockSearchProvider::default().with_results("Tokyo weather", &["https://w.example/tokyo"]),
            5,
        )
        .await;

        let events = run_to_end(&h, "What's the weather in Tokyo right now?").await;
        assert_eq!(
            events,
            vec![
                TurnEvent::ToolStarted { query: "Tokyo weather".into() },
                TurnEvent::ToolFinished {
                    urls: vec!["https://w.example/tokyo".into()],
                },
                TurnEvent::Content("It is sunny ".into()),
                TurnEvent::Content("in Tokyo.".into()),
                TurnEvent::Completed,
            ]
        );

        let requests = h.model.recorded_requests();
        assert_eq!(requests.len(), 2);
        let second = &requests[1];
        assert_eq!(second.len(), 3);
        assert_eq!(second[1].tool_calls[0].id, "call_1");
        assert_eq!(second[2].role, MessageRole::Tool);
        assert_eq!(second[2].tool_call_id.as_deref(), Some("call_1"));

        let history = h.store.load_history("c1").await.unwrap();
        let roles: Vec<MessageRole> = history.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            [MessageRole::User, MessageRole::Assistant, MessageRole::Tool, MessageRole::Assistant]
        );
    }

    #[tokio::test]
    async fn multiple_calls_run_in_request_order() {
        let h = harness(
            MockChatModel::new()
                .then_tool_calls(
                    &["Let me check. "],
                    vec![search_call("a", "first"), search_call("b", "second")],
                )
                .then_text(&["Done."]),
            MockSearchProvider::default()
                .with_results("first", &["https://1"])
                .with_results("second", &["https://2"]),
            5,
        )
        .await;

        let events = run_to_end(&h, "compare").await;
        assert_eq!(events[0], TurnEvent::Content("Let me check. ".into()));
        let starts: Vec<&TurnEvent> = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::ToolStarted { .. } | TurnEvent::ToolFinished { .. }))
            .collect();
        assert_eq!(
            starts,
            [
                &TurnEvent::ToolStarted { query: "first".into() },
                &TurnEvent::ToolFinished { urls: vec!["https://1".into()] },
                &TurnEvent::ToolStarted { query: "second".into() },
                &TurnEvent::ToolFinished { urls: vec!["https://2".into()] },
            ]
        );
        assert_eq!(h.search.recorded_queries(), ["first", "second"]);

        let history = h.store.load_history("c1").await.unwrap();
        let result_ids: Vec<_> =
            history.iter().filter_map(|m| m.tool_call_id.as_deref()).collect();
        assert_eq!(result_ids, ["a", "b"]);
    }

    #[tokio::test]
    async fn model_failure_ends_with_single_failure_event() {
        let h = harness(
            MockChatModel::new().then_fail("upstream exploded"),
            MockSearchProvider::default(),
            5,
        )
        .await;

        let events = run_to_end(&h, "hello").await;
        assert_eq!(events, vec![TurnEvent::Failed("Model invocation failed: upstream exploded".into())]);
        // the user message stays; nothing is rolled back
        assert_eq!(h.store.load_history("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_already_sent_fragments() {
        let h = harness(
            MockChatModel::new().then_chunks(vec![
                Ok(ModelChunk::Text("Par".into())),
                Err(AppError::model("connection reset")),
            ]),
            MockSearchProvider::default(),
            5,
        )
        .await;

        let events = run_to_end(&h, "hello").await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], TurnEvent::Content("Par".into()));
        assert!(matches!(&events[1], TurnEvent::Failed(m) if m.contains("connection reset")));
    }

    #[tokio::test]
    async fn tool_failure_aborts_after_tool_start() {
        let h = harness(
            MockChatModel::new().then_tool_calls(&[], vec![search_call("call_1", "news")]),
            MockSearchProvider::failing(),
            5,
        )
        .await;

        let events = run_to_end(&h, "latest news").await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TurnEvent::ToolStarted { .. }));
        assert!(matches!(&events[1], TurnEvent::Failed(m) if m.starts_with("Tool 'web_search' failed")));
        // user message and the assistant tool request were appended before the failure
        assert_eq!(h.store.load_history("c1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_tool_fails_the_turn() {
        let call = ToolCall { id: "x".into(), name: "calculator".into(), arguments: json!({}) };
        let h = harness(
            MockChatModel::new().then_tool_calls(&[], vec![call]),
            MockSearchProvider::default(),
            5,
        )
        .await;

        let events = run_to_end(&h, "2+2").await;
        assert_eq!(events, vec![TurnEvent::Failed("Model requested unknown tool 'calculator'".into())]);
        assert_eq!(h.store.load_history("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tool_round_ceiling_is_enforced() {
        let h = harness(
            MockChatModel::new()
                .then_tool_calls(&[], vec![search_call("1", "q")])
                .then_tool_calls(&[], vec![search_call("2", "q")])
                .then_tool_calls(&[], vec![search_call("3", "q")]),
            MockSearchProvider::default(),
            2,
        )
        .await;

        let events = run_to_end(&h, "loop forever").await;
        assert_eq!(
            events.last(),
            Some(&TurnEvent::Failed("Tool call limit of 2 rounds exceeded".into()))
        );
        assert_eq!(h.search.recorded_queries().len(), 2);
    }

    #[tokio::test]
    async fn missing_call_ids_are_filled_in() {
        let h = harness(
            MockChatModel::new()
                .then_tool_calls(&[], vec![search_call("", "q")])
                .then_text(&["ok"]),
            MockSearchProvider::default(),
            5,
        )
        .await;

        run_to_end(&h, "q?").await;
        let history = h.store.load_history("c1").await.unwrap();
        let call_id = &history[1].tool_calls[0].id;
        assert!(call_id.starts_with("call_"));
        assert_eq!(history[2].tool_call_id.as_ref(), Some(call_id));
    }

    #[tokio::test]
    async fn dropped_consumer_stops_the_turn() {
        let fragments: Vec<String> = (0..500).map(|i| format!("t{i} ")).collect();
        let refs: Vec<&str> = fragments.iter().map(String::as_str).collect();
        let h = harness(MockChatModel::new().then_text(&refs), MockSearchProvider::default(), 5).await;

        h.store.append(&Message::user("c1", "long answer please")).await.unwrap();
        let history = h.store.load_history("c1").await.unwrap();
        let mut rx = h.engine.start("c1".into(), history, ());
        assert!(rx.recv().await.is_some());
        drop(rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        // the answer was never completed, so it was never appended
        assert_eq!(h.store.load_history("c1").await.unwrap().len(), 1);
    }
}
