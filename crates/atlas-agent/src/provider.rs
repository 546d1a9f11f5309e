use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use atlas_core::Result;
use atlas_store::Usage;

/// Tool definition in the shape the LM API expects.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameters: serde_json::Value,
}

/// A completed tool call extracted from the model's reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    /// Raw JSON argument string as produced by the model.
    pub arguments: String,
}

/// One chat request. Messages are raw wire-format JSON objects so the tool
/// loop can append assistant tool-call turns and tool results without a
/// parallel typed representation.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<serde_json::Value>,
    pub tools: Vec<ToolDefinition>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<serde_json::Value>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Events produced while streaming one model turn.
#[derive(Debug, Clone)]
pub enum LmEvent {
    /// Incremental assistant text.
    Delta(String),
    /// The model finished its turn asking for these tool calls
    /// (arguments fully accumulated).
    ToolCalls(Vec<ToolInvocation>),
    /// Token accounting for the turn, when the API reports it.
    Usage(Usage),
    /// Terminal event of the turn.
    Done { finish_reason: String },
}

/// Common interface to the chat model.
///
/// `stream_chat` emits [`LmEvent`]s through the channel in model order and
/// returns when the turn is over; `complete` is the one-shot non-streaming
/// variant used for titling.
#[async_trait]
pub trait LmClient: Send + Sync {
    async fn stream_chat(&self, req: &ChatRequest, tx: mpsc::Sender<LmEvent>) -> Result<()>;

    async fn complete(&self, req: &ChatRequest) -> Result<String>;
}
