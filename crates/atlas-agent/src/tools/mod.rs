//! The tool set exposed to the language model.
//!
//! Tools take JSON arguments, do their work, and hand back a short
//! human-readable string for the model to read. Failures never cross the
//! boundary as errors: they become failure strings the model can act on.

pub mod datetime;
pub mod directions;
pub mod fetch;
pub mod jobs;
pub mod memory;
pub mod notify;
pub mod skills;

use std::sync::Arc;

use async_trait::async_trait;

use crate::provider::ToolDefinition;

/// Result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Text returned to the LM.
    pub content: String,
    /// Whether the tool execution failed.
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
        }
    }
}

/// Trait every tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model calls this tool by (e.g. "recall").
    fn name(&self) -> &str;
    /// What the model is told about the tool.
    fn description(&self) -> &str;
    /// JSON Schema for the tool's arguments.
    fn parameters(&self) -> serde_json::Value;
    /// Execute with the given arguments.
    async fn execute(&self, args: serde_json::Value) -> ToolResult;
}

/// Convert tools to the API-level definitions sent with each request.
pub fn to_definitions(tools: &[Arc<dyn Tool>]) -> Vec<ToolDefinition> {
    tools
        .iter()
        .map(|t| ToolDefinition {
            name: t.name().to_string(),
            description: t.description().to_string(),
            parameters: t.parameters(),
        })
        .collect()
}

/// Required string argument, or a usable error message.
pub(crate) fn required_str<'a>(
    args: &'a serde_json::Value,
    key: &str,
) -> std::result::Result<&'a str, String> {
    match args.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(format!("missing required argument '{key}'")),
    }
}
