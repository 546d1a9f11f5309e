use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use atlas_core::{Error, Result};
use atlas_store::Usage;

use crate::provider::{ChatRequest, LmClient, LmEvent, ToolInvocation};

/// Chat + titling over the OpenAI-compatible `/v1/chat/completions`
/// endpoint, streaming via SSE with incremental tool-call assembly.
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }
}

fn build_body(req: &ChatRequest, stream: bool) -> serde_json::Value {
    let mut body = json!({
        "model": req.model,
        "messages": req.messages,
    });
    if stream {
        body["stream"] = json!(true);
        body["stream_options"] = json!({"include_usage": true});
    }
    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
        body["tool_choice"] = json!("auto");
    }
    body
}

/// SSE payload line → data portion, if this line carries one.
fn parse_data_line(line: &str) -> Option<&str> {
    line.strip_prefix("data: ").map(str::trim)
}

#[derive(Debug, Default, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: DeltaContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaContent {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

/// Reassembles tool calls from their streamed fragments.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    calls: Vec<ToolInvocation>,
}

impl ToolCallAccumulator {
    fn absorb(&mut self, deltas: Vec<ToolCallDelta>) {
        for delta in deltas {
            while self.calls.len() <= delta.index {
                self.calls.push(ToolInvocation {
                    id: String::new(),
                    name: String::new(),
                    arguments: String::new(),
                });
            }
            let call = &mut self.calls[delta.index];
            if let Some(id) = delta.id {
                call.id = id;
            }
            if let Some(function) = delta.function {
                if let Some(name) = function.name {
                    call.name = name;
                }
                if let Some(fragment) = function.arguments {
                    call.arguments.push_str(&fragment);
                }
            }
        }
    }

    fn finish(self) -> Vec<ToolInvocation> {
        self.calls
    }

    fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl LmClient for OpenAiClient {
    async fn stream_chat(&self, req: &ChatRequest, tx: mpsc::Sender<LmEvent>) -> Result<()> {
        let body = build_body(req, true);
        debug!(model = %req.model, tools = req.tools.len(), "streaming chat request");

        let resp = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(%status, body = %text, "chat API error");
            return Err(Error::upstream(format!("chat API returned {status}: {text}")));
        }

        let mut buffer = String::new();
        let mut accumulator = ToolCallAccumulator::default();
        let mut finish_reason: Option<String> = None;
        let mut stream = resp.bytes_stream();

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::upstream(format!("chat stream broke: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                let Some(data) = parse_data_line(line.trim_end()) else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'outer;
                }

                let parsed: StreamChunk = serde_json::from_str(data)
                    .map_err(|e| Error::upstream(format!("malformed stream chunk: {e}")))?;

                if let Some(usage) = parsed.usage {
                    if tx.send(LmEvent::Usage(usage.into())).await.is_err() {
                        return Ok(());
                    }
                }
                for choice in parsed.choices {
                    if let Some(text) = choice.delta.content {
                        if !text.is_empty() && tx.send(LmEvent::Delta(text)).await.is_err() {
                            return Ok(());
                        }
                    }
                    if let Some(deltas) = choice.delta.tool_calls {
                        accumulator.absorb(deltas);
                    }
                    if let Some(reason) = choice.finish_reason {
                        finish_reason = Some(reason);
                    }
                }
            }
        }

        let reason = finish_reason.unwrap_or_else(|| "stop".to_string());
        if reason == "tool_calls" && !accumulator.is_empty() {
            if tx
                .send(LmEvent::ToolCalls(accumulator.finish()))
                .await
                .is_err()
            {
                return Ok(());
            }
        }
        let _ = tx.send(LmEvent::Done { finish_reason: reason }).await;
        Ok(())
    }

    async fn complete(&self, req: &ChatRequest) -> Result<String> {
        let body = build_body(req, false);
        debug!(model = %req.model, "one-shot chat request");

        let resp = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::upstream(format!("chat API returned {status}: {text}")));
        }

        let parsed: CompletionResponse = resp
            .json()
            .await
            .map_err(|e| Error::upstream(format!("malformed chat payload: {e}")))?;

        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ToolDefinition;

    #[test]
    fn data_lines_are_recognised() {
        assert_eq!(parse_data_line("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(parse_data_line("data: [DONE]"), Some("[DONE]"));
        assert_eq!(parse_data_line(": keep-alive"), None);
        assert_eq!(parse_data_line(""), None);
    }

    #[test]
    fn tool_call_fragments_reassemble() {
        let mut acc = ToolCallAccumulator::default();
        acc.absorb(
            serde_json::from_str(
                r#"[{"index":0,"id":"call_1","function":{"name":"recall","arguments":""}}]"#,
            )
            .unwrap(),
        );
        acc.absorb(
            serde_json::from_str(r#"[{"index":0,"function":{"arguments":"{\"query\":"}}]"#).unwrap(),
        );
        acc.absorb(
            serde_json::from_str(r#"[{"index":0,"function":{"arguments":"\"name\"}"}}]"#).unwrap(),
        );

        let calls = acc.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "recall");
        assert_eq!(calls[0].arguments, r#"{"query":"name"}"#);
    }

    #[test]
    fn parallel_tool_calls_keep_their_indices() {
        let mut acc = ToolCallAccumulator::default();
        acc.absorb(
            serde_json::from_str(
                r#"[{"index":0,"id":"a","function":{"name":"recall","arguments":"{}"}},
                    {"index":1,"id":"b","function":{"name":"remember","arguments":"{}"}}]"#,
            )
            .unwrap(),
        );
        let calls = acc.finish();
        assert_eq!(calls[0].name, "recall");
        assert_eq!(calls[1].name, "remember");
    }

    #[test]
    fn usage_chunk_parses_with_empty_choices() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":5,"total_tokens":17}}"#,
        )
        .unwrap();
        let usage: Usage = chunk.usage.unwrap().into();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 5);
        assert_eq!(usage.total_tokens, 17);
    }

    #[test]
    fn request_body_includes_tools_when_present() {
        let req = ChatRequest::new(
            "gpt-4o-mini",
            vec![json!({"role": "user", "content": "hi"})],
        )
        .with_tools(vec![ToolDefinition {
            name: "recall".into(),
            description: "search memory".into(),
            parameters: json!({"type": "object"}),
        }]);

        let body = build_body(&req, true);
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["stream_options"]["include_usage"], json!(true));
        assert_eq!(body["tools"][0]["function"]["name"], json!("recall"));
        assert_eq!(body["tool_choice"], json!("auto"));

        let plain = build_body(&ChatRequest::new("m", vec![]), false);
        assert!(plain.get("stream").is_none());
        assert!(plain.get("tools").is_none());
    }
}
