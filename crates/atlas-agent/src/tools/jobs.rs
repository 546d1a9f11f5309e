use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use atlas_scheduler::{JobService, JobSpec, JobUpdate};
use atlas_store::Job;

use super::{required_str, Tool, ToolResult};

fn parse_run_at(args: &Value) -> Result<Option<DateTime<Utc>>, String> {
    match args.get("run_at").and_then(|v| v.as_str()) {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| format!("'run_at' must be an ISO-8601 datetime: {e}")),
    }
}

fn describe(job: &Job) -> String {
    let schedule = match &job.cron {
        Some(cron) => format!("cron '{cron}'"),
        None => "one-shot".to_string(),
    };
    let payload = match (&job.prompt, &job.skill_name) {
        (Some(_), _) => "prompt".to_string(),
        (_, Some(skill)) => format!("skill '{skill}'"),
        _ => "?".to_string(),
    };
    format!(
        "[id {}] {} — {schedule}, {payload}, {}, next run {}",
        job.id,
        job.name,
        if job.enabled { "enabled" } else { "disabled" },
        job.next_run_at.format("%Y-%m-%d %H:%M UTC"),
    )
}

/// Enumerate scheduled jobs.
pub struct ListJobsTool {
    jobs: Arc<JobService>,
}

impl ListJobsTool {
    pub fn new(jobs: Arc<JobService>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl Tool for ListJobsTool {
    fn name(&self) -> &str {
        "list_jobs"
    }

    fn description(&self) -> &str {
        "List all scheduled jobs with their ids, schedules and status."
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: Value) -> ToolResult {
        match self.jobs.list() {
            Ok(jobs) if jobs.is_empty() => ToolResult::success("No jobs scheduled."),
            Ok(jobs) => {
                let mut out = format!("{} scheduled jobs:\n", jobs.len());
                for job in &jobs {
                    out.push_str(&format!("- {}\n", describe(job)));
                }
                ToolResult::success(out)
            }
            Err(e) => ToolResult::error(format!("could not list jobs: {e}")),
        }
    }
}

/// Create a scheduled job: a recurring or one-shot prompt, or a skill.
pub struct CreateJobTool {
    jobs: Arc<JobService>,
}

impl CreateJobTool {
    pub fn new(jobs: Arc<JobService>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl Tool for CreateJobTool {
    fn name(&self) -> &str {
        "create_job"
    }

    fn description(&self) -> &str {
        "Schedule a job. Give it either a prompt (the assistant wakes up and \
         runs it) or a skill_name with skill_config. Recurring jobs use a \
         standard 5-field cron expression; one-shot jobs use run_at."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "Human-readable job name."},
                "cron": {
                    "type": "string",
                    "description": "5-field cron schedule (e.g. '0 8 * * *'). Mutually exclusive with run_at."
                },
                "run_at": {
                    "type": "string",
                    "description": "ISO-8601 instant for a one-shot job. Mutually exclusive with cron."
                },
                "prompt": {
                    "type": "string",
                    "description": "Prompt the assistant runs when the job fires."
                },
                "skill_name": {
                    "type": "string",
                    "description": "Registered skill to run instead of a prompt."
                },
                "skill_config": {
                    "type": "object",
                    "description": "Configuration object for the skill."
                },
                "max_retries": {
                    "type": "integer",
                    "description": "Retry budget on failure (default 0)."
                }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let name = match required_str(&args, "name") {
            Ok(n) => n.to_string(),
            Err(msg) => return ToolResult::error(msg),
        };
        let run_at = match parse_run_at(&args) {
            Ok(r) => r,
            Err(msg) => return ToolResult::error(msg),
        };

        let spec = JobSpec {
            name,
            cron: args
                .get("cron")
                .and_then(|v| v.as_str())
                .map(String::from),
            run_at,
            prompt: args
                .get("prompt")
                .and_then(|v| v.as_str())
                .map(String::from),
            skill_name: args
                .get("skill_name")
                .and_then(|v| v.as_str())
                .map(String::from),
            skill_config: args.get("skill_config").cloned(),
            enabled: true,
            max_retries: args
                .get("max_retries")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
        };

        match self.jobs.create(spec) {
            Ok(job) => ToolResult::success(format!("Job created: {}", describe(&job))),
            Err(e) => ToolResult::error(format!("could not create job: {e}")),
        }
    }
}

/// Update an existing job.
pub struct UpdateJobTool {
    jobs: Arc<JobService>,
}

impl UpdateJobTool {
    pub fn new(jobs: Arc<JobService>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl Tool for UpdateJobTool {
    fn name(&self) -> &str {
        "update_job"
    }

    fn description(&self) -> &str {
        "Update a scheduled job by id: rename it, change its schedule or \
         prompt, adjust retries, or enable/disable it."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "job_id": {"type": "integer", "description": "Id of the job to update."},
                "name": {"type": "string"},
                "cron": {"type": "string", "description": "New 5-field cron schedule."},
                "run_at": {"type": "string", "description": "New ISO-8601 fire time for a one-shot job."},
                "prompt": {"type": "string"},
                "skill_config": {"type": "object"},
                "enabled": {"type": "boolean"},
                "max_retries": {"type": "integer"}
            },
            "required": ["job_id"]
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let Some(job_id) = args.get("job_id").and_then(|v| v.as_i64()) else {
            return ToolResult::error("missing required argument 'job_id'");
        };
        let run_at = match parse_run_at(&args) {
            Ok(r) => r,
            Err(msg) => return ToolResult::error(msg),
        };

        let update = JobUpdate {
            name: args.get("name").and_then(|v| v.as_str()).map(String::from),
            cron: args.get("cron").and_then(|v| v.as_str()).map(String::from),
            run_at,
            prompt: args
                .get("prompt")
                .and_then(|v| v.as_str())
                .map(String::from),
            skill_config: args.get("skill_config").cloned(),
            enabled: args.get("enabled").and_then(|v| v.as_bool()),
            max_retries: args
                .get("max_retries")
                .and_then(|v| v.as_u64())
                .map(|m| m as u32),
        };

        match self.jobs.update(job_id, update) {
            Ok(job) => ToolResult::success(format!("Job updated: {}", describe(&job))),
            Err(e) => ToolResult::error(format!("could not update job {job_id}: {e}")),
        }
    }
}

/// Delete a job.
pub struct DeleteJobTool {
    jobs: Arc<JobService>,
}

impl DeleteJobTool {
    pub fn new(jobs: Arc<JobService>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl Tool for DeleteJobTool {
    fn name(&self) -> &str {
        "delete_job"
    }

    fn description(&self) -> &str {
        "Delete a scheduled job by id."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "job_id": {"type": "integer", "description": "Id of the job to delete."}
            },
            "required": ["job_id"]
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let Some(job_id) = args.get("job_id").and_then(|v| v.as_i64()) else {
            return ToolResult::error("missing required argument 'job_id'");
        };
        match self.jobs.delete(job_id) {
            Ok(()) => ToolResult::success(format!("Job {job_id} deleted.")),
            Err(e) => ToolResult::error(format!("could not delete job {job_id}: {e}")),
        }
    }
}
