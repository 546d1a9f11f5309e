use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PushConfig;

/// A push notification. Delivery is advisory: it may be dropped, and a
/// delivery failure never fails the operation that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Emoji shortcode tag rendered by the push client (e.g. `white_check_mark`).
    pub tag: Option<String>,
    /// URL opened when the notification is tapped.
    pub click_url: Option<String>,
}

impl Notification {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            tag: None,
            click_url: None,
        }
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn click_url(mut self, url: impl Into<String>) -> Self {
        self.click_url = Some(url.into());
        self
    }
}

/// Seam for notification delivery. The production implementation posts to an
/// ntfy-style endpoint; tests substitute a recorder.
#[async_trait]
pub trait Push: Send + Sync {
    async fn notify(&self, notification: Notification);
}

/// ntfy-style push client: POST body to `<endpoint>/<channel>` with title,
/// tags and click headers.
pub struct PushClient {
    client: reqwest::Client,
    /// Fully-resolved publish URL, or `None` when push is unconfigured.
    target: Option<String>,
}

impl PushClient {
    pub fn new(config: &PushConfig) -> Self {
        let target = match (&config.endpoint, &config.channel) {
            (Some(endpoint), Some(channel)) => {
                Some(format!("{}/{}", endpoint.trim_end_matches('/'), channel))
            }
            _ => None,
        };
        Self {
            client: reqwest::Client::new(),
            target,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.target.is_some()
    }
}

#[async_trait]
impl Push for PushClient {
    async fn notify(&self, notification: Notification) {
        let Some(url) = &self.target else {
            debug!(title = %notification.title, "push not configured, dropping notification");
            return;
        };

        let mut req = self
            .client
            .post(url)
            .timeout(std::time::Duration::from_secs(10))
            .header("X-Title", notification.title.clone())
            .body(notification.body.clone());
        if let Some(tag) = &notification.tag {
            req = req.header("X-Tags", tag.clone());
        }
        if let Some(click) = &notification.click_url {
            req = req.header("X-Click", click.clone());
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(title = %notification.title, "notification delivered");
            }
            Ok(resp) => {
                warn!(status = %resp.status(), title = %notification.title, "push endpoint rejected notification");
            }
            Err(e) => {
                warn!(error = %e, title = %notification.title, "notification delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_client_has_no_target() {
        let client = PushClient::new(&PushConfig::default());
        assert!(!client.is_configured());
    }

    #[test]
    fn endpoint_without_channel_stays_unconfigured() {
        let client = PushClient::new(&PushConfig {
            endpoint: Some("https://ntfy.example".into()),
            channel: None,
        });
        assert!(!client.is_configured());
    }

    #[test]
    fn target_joins_endpoint_and_channel() {
        let client = PushClient::new(&PushConfig {
            endpoint: Some("https://ntfy.example/".into()),
            channel: Some("atlas".into()),
        });
        assert_eq!(client.target.as_deref(), Some("https://ntfy.example/atlas"));
    }

    #[tokio::test]
    async fn notify_on_unconfigured_client_is_a_noop() {
        let client = PushClient::new(&PushConfig::default());
        client.notify(Notification::new("t", "b")).await;
    }

    #[test]
    fn builder_sets_tag_and_click() {
        let n = Notification::new("t", "b").tag("x").click_url("https://a/1");
        assert_eq!(n.tag.as_deref(), Some("x"));
        assert_eq!(n.click_url.as_deref(), Some("https://a/1"));
    }
}
