//! Event Multiplexer: turns a turn's internal events into `data: <JSON>`
//! frames on one long-lived response.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use super::{error_response, AppState};
use crate::models::{ChatStreamQuery, StreamEvent};
use crate::service::turn_engine::TurnEvent;

impl From<TurnEvent> for StreamEvent {
    fn from(event: TurnEvent) -> Self {
        match event {
            TurnEvent::Content(content) => StreamEvent::Content { content },
            TurnEvent::ToolStarted { query } => StreamEvent::SearchStart { query },
            TurnEvent::ToolFinished { urls } => StreamEvent::SearchResults { urls },
            TurnEvent::Completed => StreamEvent::End,
            TurnEvent::Failed(message) => StreamEvent::Error { message },
        }
    }
}

struct Multiplexer<S> {
    events: S,
    checkpoint: Option<String>,
    finished: bool,
}

/// Orders the outbound frames: `checkpoint` first when announcing a new
/// conversation, then every event in arrival order, stopping after the
/// first terminal frame. A producer that vanishes without a terminal event
/// is reported as an error so the stream never ends silently.
pub fn multiplex<S>(checkpoint: Option<String>, events: S) -> impl Stream<Item = StreamEvent>
where
    S: Stream<Item = TurnEvent> + Unpin,
{
    let state = Multiplexer { events, checkpoint, finished: false };
    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        if let Some(checkpoint_id) = state.checkpoint.take() {
            return Some((StreamEvent::Checkpoint { checkpoint_id }, state));
        }
        let frame = match state.events.next().await {
            Some(event) => StreamEvent::from(event),
            None => StreamEvent::Error { message: "turn ended unexpectedly".to_string() },
        };
        state.finished = frame.is_terminal();
        Some((frame, state))
    })
}

/// GET `/chat_stream/{message}?checkpoint_id=...`: streams one turn as
/// `text/event-stream`.
pub async fn chat_stream_handler(
    State(state): State<AppState>,
    Path(message): Path<String>,
    Query(query): Query<ChatStreamQuery>,
    request: Request,
) -> Response {
    let client = client_key(&request);
    if let Err(e) = state.rate_limiter.check(&client).await {
        return error_response(&e);
    }

    let checkpoint_id = query.checkpoint_id.filter(|id| !id.trim().is_empty());
    let turn = match state.chat.start_turn(&message, checkpoint_id).await {
        Ok(turn) => turn,
        Err(e) => return error_response(&e),
    };
    info!(
        "Streaming turn for conversation {} (new: {})",
        turn.conversation_id, turn.is_new
    );

    let announce = turn.is_new.then(|| turn.conversation_id.clone());
    let frames = multiplex(announce, ReceiverStream::new(turn.events)).map(|frame| {
        debug!("frame: {frame:?}");
        Ok::<_, Infallible>(Event::default().data(frame.to_json()))
    });
    Sse::new(frames).into_response()
}

fn client_key(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
