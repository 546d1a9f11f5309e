use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use atlas_core::{bus::topics, EventBus};
use atlas_store::{Role, Store};

use crate::prompt::TITLE_INSTRUCTIONS;
use crate::provider::{ChatRequest, LmClient};

/// How much of the assistant reply the title prompt gets to see.
const SNIPPET_CHARS: usize = 300;

/// Gives a thread its title after the first exchange.
///
/// Subscribes to `response:complete`; anything unexpected (wrong message
/// count, deleted thread, model hiccup, empty title) is a logged no-op.
pub struct TitleHandler {
    store: Arc<Store>,
    lm: Arc<dyn LmClient>,
    bus: Arc<EventBus>,
    model: String,
}

impl TitleHandler {
    pub fn new(store: Arc<Store>, lm: Arc<dyn LmClient>, bus: Arc<EventBus>, model: String) -> Self {
        Self {
            store,
            lm,
            bus,
            model,
        }
    }

    /// Start listening. Runs until the process exits.
    pub fn spawn(self: Arc<Self>) {
        let mut events = self.bus.subscribe(topics::RESPONSE_COMPLETE);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(payload) => {
                        let Some(thread_id) = payload.as_i64() else {
                            warn!(%payload, "response:complete carried a non-numeric thread id");
                            continue;
                        };
                        self.handle(thread_id).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "title handler lagged behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub async fn handle(&self, thread_id: i64) {
        let messages = match self.store.list_messages(thread_id) {
            Ok(m) => m,
            Err(e) => {
                warn!(thread_id, error = %e, "titling skipped, could not load messages");
                return;
            }
        };

        let conversational: Vec<_> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();
        if conversational.len() != 2 {
            debug!(
                thread_id,
                count = conversational.len(),
                "not a first exchange, no title"
            );
            return;
        }

        let user_message = conversational
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.doc.content.as_str())
            .unwrap_or_default();
        let reply_snippet: String = conversational
            .iter()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.doc.content.chars().take(SNIPPET_CHARS).collect())
            .unwrap_or_default();

        let request = ChatRequest::new(
            &self.model,
            vec![
                json!({"role": "system", "content": TITLE_INSTRUCTIONS}),
                json!({"role": "user", "content": format!(
                    "User message:\n{user_message}\n\nAssistant reply (excerpt):\n{reply_snippet}"
                )}),
            ],
        );

        let title = match self.lm.complete(&request).await {
            Ok(raw) => raw.trim().trim_matches('"').to_string(),
            Err(e) => {
                warn!(thread_id, error = %e, "title generation failed");
                return;
            }
        };
        if title.is_empty() {
            debug!(thread_id, "model produced an empty title, keeping none");
            return;
        }

        if let Err(e) = self.store.update_thread_title(thread_id, &title, Utc::now()) {
            warn!(thread_id, error = %e, "could not store thread title");
            return;
        }

        self.bus.publish(
            topics::SSE,
            json!({
                "type": "thread:updated",
                "data": {"id": thread_id, "title": title},
            }),
        );
        debug!(thread_id, "thread titled");
    }
}
