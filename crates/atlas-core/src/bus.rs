use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

/// Topic capacity. Slow subscribers miss events rather than block publishers.
const TOPIC_CAPACITY: usize = 64;

/// Well-known bus topics.
pub mod topics {
    /// Payload: thread id (JSON number). Published after an assistant reply
    /// is persisted.
    pub const RESPONSE_COMPLETE: &str = "response:complete";
    /// Payload: `{type, data}` objects fanned out verbatim to connected
    /// event-stream clients.
    pub const SSE: &str = "sse";
}

/// In-process, fire-and-forget publish/subscribe.
///
/// Publishing never fails and never blocks: with no subscribers the event is
/// dropped. Subscribers that need to do long work must move it off the
/// receiving task themselves.
pub struct EventBus {
    channels: DashMap<String, broadcast::Sender<Value>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Value> {
        self.channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    pub fn publish(&self, topic: &str, payload: Value) {
        trace!(%topic, "bus publish");
        // A send error just means nobody is listening right now.
        let _ = self.sender(topic).send(payload);
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Value> {
        self.sender(topic).subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
