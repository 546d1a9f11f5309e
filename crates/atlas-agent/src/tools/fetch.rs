use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{required_str, Tool, ToolResult};

const FETCH_TIMEOUT_SECS: u64 = 15;
/// Content beyond this many characters is cut with a visible marker.
const MAX_CONTENT_CHARS: usize = 20_000;

/// Fetch a web page and hand the model its readable text.
pub struct FetchUrlTool {
    client: reqwest::Client,
}

impl FetchUrlTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for FetchUrlTool {
    fn default() -> Self {
        Self::new()
    }
}

/// Text-bearing content types only; everything else is refused before the
/// body is read.
fn is_text_content_type(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.starts_with("text/")
        || ct.contains("json")
        || ct.contains("xml")
        || ct.contains("xhtml")
}

fn truncate_marked(content: &str, max_chars: usize) -> String {
    let total = content.chars().count();
    if total <= max_chars {
        return content.to_string();
    }
    let kept: String = content.chars().take(max_chars).collect();
    format!("{kept}\n\n[... truncated, {total} characters total]")
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch a web page and return its readable content as text. Only \
         text-based content types are supported; long pages are truncated."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "Full http(s) URL to fetch."
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let url = match required_str(&args, "url") {
            Ok(u) => u,
            Err(msg) => return ToolResult::error(msg),
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return ToolResult::error("only http and https URLs can be fetched");
        }

        debug!(%url, "fetch_url tool");

        let resp = match self
            .client
            .get(url)
            .timeout(std::time::Duration::from_secs(FETCH_TIMEOUT_SECS))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return ToolResult::error(format!("could not fetch {url}: {e}")),
        };

        let status = resp.status();
        if !status.is_success() {
            return ToolResult::error(format!("{url} answered with HTTP {status}"));
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !is_text_content_type(&content_type) {
            return ToolResult::error(format!(
                "refusing to fetch non-text content (content-type: {content_type})"
            ));
        }

        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => return ToolResult::error(format!("could not read body of {url}: {e}")),
        };

        let readable = if content_type.contains("html") {
            html2text::from_read(body.as_bytes(), 100)
        } else {
            body
        };

        ToolResult::success(truncate_marked(&readable, MAX_CONTENT_CHARS))
    }
}
