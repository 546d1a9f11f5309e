//! `atlas-skills` — long-running, config-driven tasks the scheduler can run
//! in place of an LM conversation.
//!
//! A skill polls, decides, and reports a [`SkillResult`]; the scheduler
//! handles persistence, retries and notifications around it.

pub mod departure;
pub mod directions;
pub mod registry;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use departure::DepartureCheckSkill;
pub use directions::{DirectionsApi, GoogleDirections, Route, RouteQuery};
pub use registry::SkillRegistry;

/// The slice of a job a skill is allowed to see.
#[derive(Debug, Clone)]
pub struct SkillJob {
    pub id: i64,
    pub name: String,
    pub config: serde_json::Value,
}

/// Everything a skill needs while executing. The cancel token fires on
/// scheduler shutdown; sleeps and loops must honour it.
pub struct SkillContext {
    pub job: SkillJob,
    pub cancel: CancellationToken,
}

/// Outcome of one skill execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillResult {
    pub success: bool,
    pub message: String,
    /// On success, additionally flip the job's `enabled` off
    /// (one-shot skill style).
    pub disable_job: bool,
}

impl SkillResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            disable_job: false,
        }
    }

    pub fn ok_and_disable(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            disable_job: true,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            disable_job: false,
        }
    }
}

/// A named, described, config-validated unit of scheduled work.
#[async_trait]
pub trait Skill: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the job's `skill_config`.
    fn config_schema(&self) -> serde_json::Value;
    async fn execute(&self, ctx: SkillContext) -> SkillResult;
}
