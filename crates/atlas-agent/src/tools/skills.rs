use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use atlas_skills::SkillRegistry;

use super::{Tool, ToolResult};

/// Show the model which skills exist and how to configure them.
pub struct ListSkillsTool {
    registry: Arc<SkillRegistry>,
}

impl ListSkillsTool {
    pub fn new(registry: Arc<SkillRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for ListSkillsTool {
    fn name(&self) -> &str {
        "list_skills"
    }

    fn description(&self) -> &str {
        "List the skills that can be scheduled as jobs, with their config \
         schemas. Use this before creating a skill job."
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value) -> ToolResult {
        let skills = self.registry.list();
        if skills.is_empty() {
            return ToolResult::success("No skills are registered.");
        }
        let mut out = format!("{} registered skills:\n", skills.len());
        for skill in skills {
            out.push_str(&format!(
                "- {}: {}\n  config schema: {}\n",
                skill.name(),
                skill.description(),
                skill.config_schema(),
            ));
        }
        ToolResult::success(out)
    }
}
