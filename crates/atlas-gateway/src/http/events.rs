//! Server-wide event channel — GET /api/events
//!
//! Forwards whatever the in-process bus publishes on the `sse` topic, using
//! the payload's `type` as the SSE event name.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::Stream;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use atlas_core::bus::topics;

use crate::app::AppState;
use crate::http::chat::KEEP_ALIVE_INTERVAL;

pub async fn events_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.bus.subscribe(topics::SSE);

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(payload) => {
                    let name = payload
                        .get("type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("message")
                        .to_string();
                    let data = payload.get("data").cloned().unwrap_or_else(|| json!({}));
                    yield Ok(Event::default().event(name).data(data.to_string()));
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "event stream lagged behind the bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}
