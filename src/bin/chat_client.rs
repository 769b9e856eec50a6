//! Terminal client for the chat stream.
//!
//! Reads one message per line from stdin, streams the answer, and carries
//! the checkpoint id across turns so follow-up questions keep their context.

use std::io::Write;
use std::pin::pin;

use anyhow::{anyhow, Context};
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use reqwest::Url;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use web_search_chat::models::{parse_payload, StreamEvent};

/// How a single stream ended.
#[derive(Debug, PartialEq)]
enum Outcome {
    Finished,
    Failed(String),
    Closed,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let base = std::env::var("BACKEND_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());
    let base = Url::parse(&base).with_context(|| format!("Invalid BACKEND_URL '{base}'"))?;
    let client = reqwest::Client::new();
    let mut checkpoint_id: Option<String> = None;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt()?;
    while let Some(line) = lines.next_line().await? {
        let message = line.trim();
        if message.is_empty() {
            prompt()?;
            continue;
        }
        match send(&client, &base, message, &mut checkpoint_id).await {
            Ok(Outcome::Finished) => println!(),
            Ok(Outcome::Failed(message)) => eprintln!("\n[error] {message}"),
            Ok(Outcome::Closed) => eprintln!("\n[error] connection closed before the answer finished"),
            Err(e) => eprintln!("\n[error] {e:#}"),
        }
        prompt()?;
    }
    Ok(())
}

fn prompt() -> std::io::Result<()> {
    print!("> ");
    std::io::stdout().flush()
}

async fn send(
    client: &reqwest::Client,
    base: &Url,
    message: &str,
    checkpoint_id: &mut Option<String>,
) -> anyhow::Result<Outcome> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow!("BACKEND_URL cannot be a base URL"))?
        .pop_if_empty()
        .push("chat_stream")
        .push(message);
    if let Some(id) = checkpoint_id.as_deref() {
        url.query_pairs_mut().append_pair("checkpoint_id", id);
    }

    let response = client.get(url).send().await.context("request failed")?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("HTTP {status}: {body}"));
    }

    read_events(response.bytes_stream(), &mut std::io::stdout(), checkpoint_id).await
}

/// Consumes an event-stream body until a terminal frame or the end of input.
async fn read_events<S, B, E>(
    body: S,
    out: &mut impl Write,
    checkpoint_id: &mut Option<String>,
) -> anyhow::Result<Outcome>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut events = pin!(body.eventsource());
    while let Some(event) = events.next().await {
        let event = event.map_err(|e| anyhow!("stream error: {e}"))?;
        if event.data.is_empty() {
            continue;
        }
        let event = parse_payload(&event.data).map_err(|e| anyhow!("protocol error: {e}"))?;
        debug!("event: {event:?}");
        if let Some(outcome) = render(event, out, checkpoint_id)? {
            return Ok(outcome);
        }
    }
    Ok(Outcome::Closed)
}

/// Renders one event; returns the outcome once the stream is finished.
fn render(
    event: StreamEvent,
    out: &mut impl Write,
    checkpoint_id: &mut Option<String>,
) -> std::io::Result<Option<Outcome>> {
    match event {
        StreamEvent::Checkpoint { checkpoint_id: id } => *checkpoint_id = Some(id),
        StreamEvent::Content { content } => {
            write!(out, "{content}")?;
            out.flush()?;
        }
        StreamEvent::SearchStart { query } => eprintln!("[searching for: {query}]"),
        StreamEvent::SearchResults { urls } => {
            for url in urls {
                eprintln!("  {url}");
            }
        }
        StreamEvent::Error { message } => return Ok(Some(Outcome::Failed(message))),
        StreamEvent::End => return Ok(Some(Outcome::Finished)),
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;

    fn chunks(parts: Vec<&[u8]>) -> impl Stream<Item = Result<Vec<u8>, std::io::Error>> {
        stream::iter(parts.into_iter().map(|p| Ok(p.to_vec())).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn multibyte_character_split_across_chunks_is_kept() {
        let wire = "data: {\"type\":\"content\",\"content\":\"18\u{b0}C\"}\n\ndata: {\"type\":\"end\"}\n\n";
        let bytes = wire.as_bytes();
        // split right after the first byte of the two-byte degree sign
        let split = bytes.iter().position(|b| *b == 0xC2).unwrap() + 1;
        let mut out = Vec::<u8>::new();
        let mut checkpoint_id = None;

        let outcome = read_events(chunks(vec![&bytes[..split], &bytes[split..]]), &mut out, &mut checkpoint_id)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Finished);
        assert_eq!(String::from_utf8(out).unwrap(), "18\u{b0}C");
    }

    #[tokio::test]
    async fn checkpoint_is_remembered_and_error_frames_end_the_stream() {
        let wire = b"data: {\"type\":\"checkpoint\",\"checkpoint_id\":\"abc\"}\n\n\
                     data: {\"type\":\"content\",\"content\":\"Par\"}\n\n\
                     data: {\"type\":\"error\",\"message\":\"model down\"}\n\n";
        let mut out = Vec::<u8>::new();
        let mut checkpoint_id = None;

        let outcome = read_events(chunks(vec![&wire[..]]), &mut out, &mut checkpoint_id).await.unwrap();

        assert_eq!(outcome, Outcome::Failed("model down".into()));
        assert_eq!(checkpoint_id.as_deref(), Some("abc"));
        assert_eq!(out, b"Par");
    }

    #[tokio::test]
    async fn stream_without_terminal_frame_is_reported_as_closed() {
        let wire = b"data: {\"type\":\"content\",\"content\":\"partial\"}\n\n";
        let mut checkpoint_id = None;
        let outcome = read_events(chunks(vec![&wire[..]]), &mut Vec::<u8>::new(), &mut checkpoint_id).await.unwrap();
        assert_eq!(outcome, Outcome::Closed);
    }

    #[tokio::test]
    async fn unknown_event_type_is_a_protocol_error() {
        let wire = b"data: {\"type\":\"limit\"}\n\n";
        let mut checkpoint_id = None;
        let err = read_events(chunks(vec![&wire[..]]), &mut Vec::<u8>::new(), &mut checkpoint_id).await.unwrap_err();
        assert!(err.to_string().contains("protocol error"));
    }
}
