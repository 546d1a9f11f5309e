use std::collections::BTreeMap;
use std::sync::Arc;

use crate::Skill;

/// Name → skill mapping, fixed at composition time.
#[derive(Default)]
pub struct SkillRegistry {
    skills: BTreeMap<String, Arc<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, skill: Arc<dyn Skill>) {
        self.skills.insert(skill.name().to_string(), skill);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Skill>> {
        self.skills.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.skills.contains_key(name)
    }

    /// All registered skills in name order.
    pub fn list(&self) -> Vec<Arc<dyn Skill>> {
        self.skills.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SkillContext, SkillResult};
    use async_trait::async_trait;

    struct NoopSkill(&'static str);

    #[async_trait]
    impl Skill for NoopSkill {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "does nothing"
        }
        fn config_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _ctx: SkillContext) -> SkillResult {
            SkillResult::ok("done")
        }
    }

    #[test]
    fn lookup_and_listing() {
        let mut reg = SkillRegistry::new();
        reg.register(Arc::new(NoopSkill("b-skill")));
        reg.register(Arc::new(NoopSkill("a-skill")));

        assert!(reg.contains("a-skill"));
        assert!(reg.get("missing").is_none());

        let names: Vec<String> = reg.list().iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["a-skill", "b-skill"]);
    }
}
