//! Chat streaming endpoint — POST /api/chat
//!
//! Request: `{"thread_id"?: number|string, "message": string}`.
//! Response: a text/event-stream with events `thread`, `delta`, `tool_call`,
//! `tool_result`, then exactly one of `done` or `error`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use chrono::Utc;
use futures_util::Stream;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use atlas_agent::StreamEvent;
use atlas_core::Error;
use atlas_store::ThreadSource;

use crate::app::AppState;
use crate::http::ApiError;

/// Intermediary proxies like to drop idle streams; comment every 30 s.
pub(crate) const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
pub struct ChatBody {
    /// Existing thread to continue; a new thread is created when absent.
    /// The UI sends ids as strings, so both encodings are accepted.
    #[serde(default)]
    pub thread_id: Option<serde_json::Value>,
    pub message: String,
}

/// Accept a numeric or string-encoded thread id.
fn coerce_thread_id(raw: &serde_json::Value) -> Result<i64, Error> {
    match raw {
        serde_json::Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::validation("thread_id must be an integer")),
        serde_json::Value::String(s) => s
            .parse()
            .map_err(|_| Error::validation(format!("thread_id '{s}' is not an integer"))),
        _ => Err(Error::validation("thread_id must be a number or string")),
    }
}

/// Wire name and payload for one core stream event.
fn event_payload(event: &StreamEvent) -> (&'static str, serde_json::Value) {
    match event {
        StreamEvent::Delta { text } => ("delta", json!({"content": text})),
        StreamEvent::ToolCall {
            call_id,
            name,
            arguments,
        } => (
            "tool_call",
            json!({"callId": call_id, "name": name, "arguments": arguments}),
        ),
        StreamEvent::ToolResult {
            call_id,
            name,
            output,
        } => (
            "tool_result",
            json!({"callId": call_id, "name": name, "output": output}),
        ),
    }
}

fn to_sse_event(event: StreamEvent) -> Event {
    let (name, payload) = event_payload(&event);
    Event::default().event(name).data(payload.to_string())
}

pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let message = body.message.trim().to_string();
    if message.is_empty() {
        return Err(Error::validation("message must not be empty").into());
    }

    // Resolve the thread before the first event so the stream can announce it.
    let thread_id = match &body.thread_id {
        Some(raw) => {
            let id = coerce_thread_id(raw)?;
            state.store.thread(id)?.id
        }
        None => {
            state
                .store
                .create_thread(ThreadSource::User, None, None, Utc::now())?
                .id
        }
    };
    debug!(thread_id, "chat stream starting");

    let mut run = state.agent.run_stream(thread_id, message);

    let stream = async_stream::stream! {
        yield Ok(Event::default()
            .event("thread")
            .data(json!({"thread_id": thread_id}).to_string()));

        while let Some(event) = run.events.recv().await {
            yield Ok(to_sse_event(event));
        }

        match run.outcome.await {
            Ok(Ok(usage)) => {
                let data = match usage {
                    Some(u) => json!({"usage": u}),
                    None => json!({}),
                };
                yield Ok(Event::default().event("done").data(data.to_string()));
            }
            Ok(Err(e)) => {
                yield Ok(Event::default()
                    .event("error")
                    .data(json!({"message": e.to_string()}).to_string()));
            }
            Err(_) => {
                yield Ok(Event::default()
                    .event("error")
                    .data(json!({"message": "run aborted"}).to_string()));
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_coercion_accepts_both_encodings() {
        assert_eq!(coerce_thread_id(&json!(7)).unwrap(), 7);
        assert_eq!(coerce_thread_id(&json!("42")).unwrap(), 42);
        assert!(coerce_thread_id(&json!("nope")).is_err());
        assert!(coerce_thread_id(&json!(true)).is_err());
    }

    #[test]
    fn stream_events_translate_to_wire_names() {
        let (name, data) = event_payload(&StreamEvent::Delta { text: "hi".into() });
        assert_eq!(name, "delta");
        assert_eq!(data, json!({"content": "hi"}));

        let (name, data) = event_payload(&StreamEvent::ToolCall {
            call_id: "c1".into(),
            name: "recall".into(),
            arguments: "{}".into(),
        });
        assert_eq!(name, "tool_call");
        assert_eq!(
            data,
            json!({"callId": "c1", "name": "recall", "arguments": "{}"})
        );

        let (name, data) = event_payload(&StreamEvent::ToolResult {
            call_id: "c1".into(),
            name: "recall".into(),
            output: "found".into(),
        });
        assert_eq!(name, "tool_result");
        assert_eq!(
            data,
            json!({"callId": "c1", "name": "recall", "output": "found"})
        );
    }
}
