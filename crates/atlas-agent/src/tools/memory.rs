use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use atlas_memory::MemoryService;
use atlas_store::MemorySource;

use super::{required_str, Tool, ToolResult};

/// Maximum entries `recall` will return regardless of what the model asks.
const RECALL_LIMIT_CAP: usize = 20;

/// Store one atomic fact in long-term memory.
pub struct RememberTool {
    memory: Arc<MemoryService>,
}

impl RememberTool {
    pub fn new(memory: Arc<MemoryService>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for RememberTool {
    fn name(&self) -> &str {
        "remember"
    }

    fn description(&self) -> &str {
        "Store ONE atomic fact in persistent memory. ALWAYS call recall first: \
         if the fact already exists, pass its id as replace_id to overwrite it \
         instead of creating a duplicate."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The single fact to remember."
                },
                "replace_id": {
                    "type": "integer",
                    "description": "Id of an existing memory to overwrite (from a recall result)."
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let content = match required_str(&args, "content") {
            Ok(c) => c,
            Err(msg) => return ToolResult::error(msg),
        };
        let replace_id = args.get("replace_id").and_then(|v| v.as_i64());

        match self
            .memory
            .remember(content, MemorySource::Agent, None, replace_id)
            .await
        {
            Ok(entry) => {
                debug!(memory_id = entry.id, "remember tool stored a fact");
                match replace_id {
                    Some(id) => ToolResult::success(format!("Updated memory {id}: {content}")),
                    None => ToolResult::success(format!("Remembered: {content}")),
                }
            }
            Err(e) => ToolResult::error(format!("could not store the memory: {e}")),
        }
    }
}

/// Search long-term memory by semantic similarity.
pub struct RecallTool {
    memory: Arc<MemoryService>,
}

impl RecallTool {
    pub fn new(memory: Arc<MemoryService>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for RecallTool {
    fn name(&self) -> &str {
        "recall"
    }

    fn description(&self) -> &str {
        "Search persistent memory for facts relevant to a query. Returns \
         matching memories with their ids and relevance, best match first."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look for."
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum results (default 10, at most 20)."
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let query = match required_str(&args, "query") {
            Ok(q) => q,
            Err(msg) => return ToolResult::error(msg),
        };
        let limit = args
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|l| (l as usize).min(RECALL_LIMIT_CAP))
            .unwrap_or(atlas_memory::service::DEFAULT_RECALL_LIMIT);

        match self.memory.recall(query, limit).await {
            Ok(hits) if hits.is_empty() => {
                ToolResult::success("No matching memories found.")
            }
            Ok(hits) => {
                let mut out = format!("Found {} matching memories:\n", hits.len());
                for hit in &hits {
                    out.push_str(&format!(
                        "- [id {}] ({:.0}%) {}\n",
                        hit.entry.id,
                        hit.similarity * 100.0,
                        hit.entry.content,
                    ));
                }
                ToolResult::success(out)
            }
            Err(e) => ToolResult::error(format!("memory search failed: {e}")),
        }
    }
}
