use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use atlas_core::{schedule, Error, Result};
use atlas_skills::SkillRegistry;
use atlas_store::{Job, JobRun, NewJob, Store};

/// Definition of a new job as accepted from tools and the REST surface.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub name: String,
    /// Recurring schedule. Mutually exclusive with `run_at`.
    pub cron: Option<String>,
    /// One-shot fire instant. Mutually exclusive with `cron`.
    pub run_at: Option<DateTime<Utc>>,
    pub prompt: Option<String>,
    pub skill_name: Option<String>,
    pub skill_config: Option<serde_json::Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub max_retries: u32,
}

fn default_enabled() -> bool {
    true
}

impl Default for JobSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            cron: None,
            run_at: None,
            prompt: None,
            skill_name: None,
            skill_config: None,
            enabled: true,
            max_retries: 0,
        }
    }
}

/// Partial update. Absent fields keep their current value; the payload kind
/// of a job cannot change after creation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub cron: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
    pub prompt: Option<String>,
    pub skill_config: Option<serde_json::Value>,
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
}

/// Validated CRUD over job definitions.
pub struct JobService {
    store: Arc<Store>,
    skills: Arc<SkillRegistry>,
}

impl JobService {
    pub fn new(store: Arc<Store>, skills: Arc<SkillRegistry>) -> Self {
        Self { store, skills }
    }

    pub fn create(&self, spec: JobSpec) -> Result<Job> {
        if spec.name.trim().is_empty() {
            return Err(Error::validation("job name must not be empty"));
        }

        let is_prompt = spec.prompt.as_deref().is_some_and(|p| !p.trim().is_empty());
        let is_skill = spec.skill_name.is_some();
        if is_prompt == is_skill {
            return Err(Error::validation(
                "a job carries exactly one payload: a prompt, or a skill name with config",
            ));
        }
        if let Some(skill_name) = &spec.skill_name {
            if !self.skills.contains(skill_name) {
                return Err(Error::validation(format!("unknown skill: {skill_name}")));
            }
        }

        let now = Utc::now();
        let next_run_at = match (&spec.cron, spec.run_at) {
            (Some(cron), None) => schedule::next_fire_after(cron, now)?.ok_or_else(|| {
                Error::validation(format!("cron expression '{cron}' never fires"))
            })?,
            (None, Some(run_at)) => run_at,
            (Some(_), Some(_)) => {
                return Err(Error::validation(
                    "a job is either recurring (cron) or one-shot (run_at), not both",
                ))
            }
            (None, None) => {
                return Err(Error::validation(
                    "a job needs a schedule: cron or run_at",
                ))
            }
        };

        let skill_config = if is_skill {
            Some(spec.skill_config.unwrap_or_else(|| serde_json::json!({})))
        } else {
            None
        };

        let job = self.store.insert_job(
            &NewJob {
                name: spec.name.trim().to_string(),
                cron: spec.cron,
                prompt: spec.prompt.filter(|p| !p.trim().is_empty()),
                skill_name: spec.skill_name,
                skill_config,
                enabled: spec.enabled,
                max_retries: spec.max_retries,
                next_run_at,
            },
            now,
        )?;
        info!(job_id = job.id, name = %job.name, "job registered");
        Ok(job)
    }

    pub fn get(&self, id: i64) -> Result<Job> {
        self.store.job(id)
    }

    /// A job together with its run history, most recent run first.
    pub fn get_with_runs(&self, id: i64) -> Result<(Job, Vec<JobRun>)> {
        let job = self.store.job(id)?;
        let runs = self.store.list_runs(id)?;
        Ok((job, runs))
    }

    pub fn list(&self) -> Result<Vec<Job>> {
        self.store.list_jobs()
    }

    pub fn update(&self, id: i64, update: JobUpdate) -> Result<Job> {
        let mut job = self.store.job(id)?;
        let now = Utc::now();

        if let Some(name) = update.name {
            if name.trim().is_empty() {
                return Err(Error::validation("job name must not be empty"));
            }
            job.name = name.trim().to_string();
        }
        if let Some(prompt) = update.prompt {
            if job.prompt.is_none() {
                return Err(Error::validation(
                    "cannot set a prompt on a skill job",
                ));
            }
            job.prompt = Some(prompt);
        }
        if let Some(config) = update.skill_config {
            if job.skill_name.is_none() {
                return Err(Error::validation(
                    "cannot set skill config on a prompt job",
                ));
            }
            job.skill_config = Some(config);
        }
        if let Some(cron) = update.cron {
            let next = schedule::next_fire_after(&cron, now)?
                .ok_or_else(|| Error::validation(format!("cron expression '{cron}' never fires")))?;
            job.cron = Some(cron);
            job.next_run_at = next;
        }
        if let Some(run_at) = update.run_at {
            if job.cron.is_some() {
                return Err(Error::validation(
                    "cannot set run_at on a recurring job; change the cron instead",
                ));
            }
            job.next_run_at = run_at;
        }
        if let Some(enabled) = update.enabled {
            job.enabled = enabled;
        }
        if let Some(max_retries) = update.max_retries {
            job.max_retries = max_retries;
        }

        self.store.update_job(&job, now)?;
        self.store.job(id)
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        self.store.delete_job(id, Utc::now())
    }
}
