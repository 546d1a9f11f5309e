use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use atlas_core::{Notification, Push};

use super::{required_str, Tool, ToolResult};

/// Let the model push a notification to the user's devices.
pub struct NotifyTool {
    push: Arc<dyn Push>,
}

impl NotifyTool {
    pub fn new(push: Arc<dyn Push>) -> Self {
        Self { push }
    }
}

#[async_trait]
impl Tool for NotifyTool {
    fn name(&self) -> &str {
        "notify"
    }

    fn description(&self) -> &str {
        "Send a push notification to the user. Use for things the user should \
         see even when they are not looking at the conversation."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string", "description": "Short notification title."},
                "body": {"type": "string", "description": "Notification text."},
                "tag": {
                    "type": "string",
                    "description": "Optional emoji shortcode tag (e.g. 'bell')."
                }
            },
            "required": ["title", "body"]
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let title = match required_str(&args, "title") {
            Ok(t) => t,
            Err(msg) => return ToolResult::error(msg),
        };
        let body = match required_str(&args, "body") {
            Ok(b) => b,
            Err(msg) => return ToolResult::error(msg),
        };

        let mut notification = Notification::new(title, body);
        if let Some(tag) = args.get("tag").and_then(|v| v.as_str()) {
            notification = notification.tag(tag);
        }
        // Delivery is advisory; the client logs and swallows failures.
        self.push.notify(notification).await;
        ToolResult::success(format!("Notification sent: {title}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPush {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Push for RecordingPush {
        async fn notify(&self, notification: Notification) {
            self.sent.lock().unwrap().push(notification);
        }
    }

    #[tokio::test]
    async fn sends_title_body_and_tag() {
        let push = Arc::new(RecordingPush::default());
        let tool = NotifyTool::new(push.clone());
        let result = tool
            .execute(json!({"title": "Reminder", "body": "Stand up", "tag": "bell"}))
            .await;
        assert!(!result.is_error);
        let sent = push.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "Reminder");
        assert_eq!(sent[0].tag.as_deref(), Some("bell"));
    }

    #[tokio::test]
    async fn missing_body_is_an_error_string() {
        let tool = NotifyTool::new(Arc::new(RecordingPush::default()));
        let result = tool.execute(json!({"title": "t"})).await;
        assert!(result.is_error);
        assert!(result.content.contains("body"));
    }
}
