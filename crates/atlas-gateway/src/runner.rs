use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use atlas_agent::AgentService;
use atlas_core::{Error, Result};
use atlas_scheduler::PromptRunner;
use atlas_store::{Job, JobRun, Store, ThreadSource};

/// Bridges the scheduler to the conversation engine: a prompt job becomes a
/// wake thread whose stream is drained to completion with no consumer.
pub struct AgentPromptRunner {
    store: Arc<Store>,
    agent: Arc<AgentService>,
}

impl AgentPromptRunner {
    pub fn new(store: Arc<Store>, agent: Arc<AgentService>) -> Self {
        Self { store, agent }
    }
}

#[async_trait]
impl PromptRunner for AgentPromptRunner {
    async fn run_prompt(&self, job: &Job, run: &JobRun) -> Result<i64> {
        let prompt = job
            .prompt
            .clone()
            .ok_or_else(|| Error::internal(format!("prompt job {} has no prompt", job.id)))?;

        let thread = self
            .store
            .create_thread(ThreadSource::Wake, None, Some(run.id), Utc::now())?;
        debug!(job_id = job.id, thread_id = thread.id, "wake thread created");

        let mut stream = self.agent.run_stream(thread.id, prompt);
        // Nobody is watching a wake run; consume the stream so the engine
        // can finish, and keep only the outcome.
        while stream.events.recv().await.is_some() {}

        match stream.outcome.await {
            Ok(Ok(_usage)) => Ok(thread.id),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::internal("run outcome channel closed unexpectedly")),
        }
    }
}
