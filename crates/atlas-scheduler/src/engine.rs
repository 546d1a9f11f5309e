use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use atlas_core::{schedule, Error, Notification, Push, Result};
use atlas_skills::{SkillContext, SkillJob, SkillRegistry};
use atlas_store::{Job, JobRun, Store};

/// Cadence of the serialized tick loop.
pub const TICK_INTERVAL: StdDuration = StdDuration::from_secs(30);
/// Cadence of the background lease refresher during a run.
const LEASE_REFRESH_INTERVAL: StdDuration = StdDuration::from_secs(120);
/// Retry backoff: 30 s doubling per attempt, capped at 15 minutes.
const RETRY_BASE_BACKOFF_SECS: i64 = 30;
const RETRY_MAX_BACKOFF_SECS: i64 = 900;

/// Executes a prompt job end to end: creates the wake thread, drives the
/// conversation to completion, returns the thread id. Implemented by the
/// composition root over the conversation engine.
#[async_trait]
pub trait PromptRunner: Send + Sync {
    async fn run_prompt(&self, job: &Job, run: &JobRun) -> Result<i64>;
}

/// The tick-driven job executor.
///
/// Correctness rests on the store primitives: idempotent enqueue, atomic
/// single-claim, and the lease. The engine itself holds no state a crash
/// could lose.
pub struct Scheduler {
    store: Arc<Store>,
    skills: Arc<SkillRegistry>,
    runner: Arc<dyn PromptRunner>,
    push: Arc<dyn Push>,
    app_url: Option<String>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        skills: Arc<SkillRegistry>,
        runner: Arc<dyn PromptRunner>,
        push: Arc<dyn Push>,
        app_url: Option<String>,
    ) -> Self {
        Self {
            store,
            skills,
            runner,
            push,
            app_url,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancel the tick loop and every in-flight run's cancel signal.
    /// In-flight work exits cooperatively; anything that does not is
    /// reclaimed by the lease after a restart.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Tick loop: one tick immediately, then every 30 s. Ticks serialize;
    /// a tick in progress delays the next.
    pub async fn run(self: Arc<Self>) {
        info!("scheduler started");
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// One tick. Claims before it reclaims and enqueues, so a tick never
    /// executes a row it created itself: work enqueued or reclaimed here is
    /// picked up on the next tick.
    async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        if let Some(run) = self.store.claim_pending_run(now)? {
            self.execute_run(run).await;
        }

        let reclaimed = self.store.reset_abandoned_runs(now)?;
        if reclaimed > 0 {
            warn!(reclaimed, "reclaimed abandoned runs");
        }

        for job in self.store.jobs_due(now)? {
            let inserted = self.store.enqueue_run(job.id, job.next_run_at, now)?;
            if inserted {
                debug!(job_id = job.id, scheduled_for = %job.next_run_at, "run enqueued");
            }
            self.advance_job(&job, now);
        }

        Ok(())
    }

    /// Move `next_run_at` past `now`, or disable the job when its schedule
    /// is exhausted (one-shot fired, or cron with no future fire).
    fn advance_job(&self, job: &Job, now: DateTime<Utc>) {
        let outcome = match &job.cron {
            Some(cron) => match schedule::next_fire_after(cron, now) {
                Ok(Some(next)) => self.store.set_job_next_run(job.id, next, now),
                Ok(None) => {
                    warn!(job_id = job.id, cron = %cron, "cron admits no future fire, disabling job");
                    self.store.set_job_enabled(job.id, false, now)
                }
                Err(e) => {
                    warn!(job_id = job.id, error = %e, "stored cron no longer parses, disabling job");
                    self.store.set_job_enabled(job.id, false, now)
                }
            },
            None => self.store.set_job_enabled(job.id, false, now),
        };
        if let Err(e) = outcome {
            error!(job_id = job.id, error = %e, "failed to advance job schedule");
        }
    }

    async fn execute_run(&self, run: JobRun) {
        let job = match self.store.job(run.job_id) {
            Ok(job) => job,
            Err(Error::NotFound(_)) => {
                warn!(run_id = run.id, job_id = run.job_id, "job gone, failing run");
                if let Err(e) = self.store.fail_run(run.id, "Job not found", Utc::now()) {
                    error!(run_id = run.id, error = %e, "could not fail orphaned run");
                }
                return;
            }
            Err(e) => {
                // Leave the row leased; the reclaim path retries it later.
                error!(run_id = run.id, error = %e, "job lookup failed");
                return;
            }
        };

        info!(run_id = run.id, job = %job.name, "executing run");

        let refresher_stop = CancellationToken::new();
        let refresher = spawn_lease_refresher(self.store.clone(), run.id, refresher_stop.clone());

        let outcome = if job.is_prompt_job() {
            self.execute_prompt(&job, &run).await
        } else {
            self.execute_skill(&job, &run).await
        };

        refresher_stop.cancel();
        let _ = refresher.await;

        if let Err(message) = outcome {
            self.handle_failure(&job, &run, &message).await;
        }
    }

    async fn execute_prompt(&self, job: &Job, run: &JobRun) -> std::result::Result<(), String> {
        let thread_id = self
            .runner
            .run_prompt(job, run)
            .await
            .map_err(|e| e.to_string())?;

        let now = Utc::now();
        self.store
            .complete_run(run.id, Some(thread_id), now)
            .map_err(|e| e.to_string())?;
        if let Err(e) = self.store.set_job_last_run(job.id, now, now) {
            error!(job_id = job.id, error = %e, "failed to record last_run_at");
        }

        let prompt = job.prompt.as_deref().unwrap_or_default();
        let mut notification =
            Notification::new(format!("Job completed: {}", job.name), truncate(prompt, 200))
                .tag("white_check_mark");
        if let Some(app_url) = &self.app_url {
            notification = notification.click_url(format!(
                "{}/threads/{thread_id}",
                app_url.trim_end_matches('/')
            ));
        }
        self.push.notify(notification).await;

        info!(run_id = run.id, thread_id, "prompt run completed");
        Ok(())
    }

    async fn execute_skill(&self, job: &Job, run: &JobRun) -> std::result::Result<(), String> {
        let skill_name = job.skill_name.as_deref().unwrap_or_default();
        let skill = self
            .skills
            .get(skill_name)
            .ok_or_else(|| format!("Unknown skill: {skill_name}"))?;

        let ctx = SkillContext {
            job: SkillJob {
                id: job.id,
                name: job.name.clone(),
                config: job
                    .skill_config
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({})),
            },
            cancel: self.shutdown.child_token(),
        };

        let result = skill.execute(ctx).await;
        if !result.success {
            return Err(result.message);
        }

        let now = Utc::now();
        if result.disable_job {
            if let Err(e) = self.store.set_job_enabled(job.id, false, now) {
                error!(job_id = job.id, error = %e, "failed to disable job after skill request");
            }
        }
        self.store
            .complete_run(run.id, None, now)
            .map_err(|e| e.to_string())?;
        if let Err(e) = self.store.set_job_last_run(job.id, now, now) {
            error!(job_id = job.id, error = %e, "failed to record last_run_at");
        }

        info!(run_id = run.id, skill = skill_name, message = %result.message, "skill run completed");
        Ok(())
    }

    /// Terminal failures notify; failures with retry budget left go back to
    /// pending behind an exponential backoff gate.
    async fn handle_failure(&self, job: &Job, run: &JobRun, message: &str) {
        error!(run_id = run.id, job = %job.name, message, "run failed");
        let now = Utc::now();

        let attempts_exhausted = run.retry_count + 1 >= job.max_retries;
        if attempts_exhausted {
            if let Err(e) = self.store.fail_run(run.id, message, now) {
                error!(run_id = run.id, error = %e, "could not mark run failed");
            }
            self.push
                .notify(
                    Notification::new(format!("Job failed: {}", job.name), truncate(message, 200))
                        .tag("x"),
                )
                .await;
        } else {
            let shift = run.retry_count.min(10);
            let backoff_secs = (RETRY_BASE_BACKOFF_SECS << shift).min(RETRY_MAX_BACKOFF_SECS);
            let backoff_until = now + Duration::seconds(backoff_secs);
            if let Err(e) = self.store.requeue_run(run.id, message, backoff_until) {
                error!(run_id = run.id, error = %e, "could not requeue run");
            }
        }
    }
}

fn spawn_lease_refresher(
    store: Arc<Store>,
    run_id: i64,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LEASE_REFRESH_INTERVAL);
        // An interval's first tick is immediate; the claim already granted a
        // fresh lease, so skip it.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = store.refresh_run_lock(run_id, Utc::now()) {
                        warn!(run_id, error = %e, "lease refresh failed");
                    }
                }
            }
        }
    })
}

/// First `max` characters on a char boundary.
fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_skills::{Skill, SkillRegistry, SkillResult};
    use atlas_store::{MessageDoc, NewJob, Role, RunStatus, ThreadSource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubRunner {
        store: Arc<Store>,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl PromptRunner for StubRunner {
        async fn run_prompt(&self, _job: &Job, run: &JobRun) -> Result<i64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::upstream("LM unavailable"));
            }
            let thread =
                self.store
                    .create_thread(ThreadSource::Wake, None, Some(run.id), Utc::now())?;
            self.store.add_message(
                thread.id,
                &MessageDoc::new(Role::Assistant, "all quiet"),
                Some("gpt-4o-mini"),
                Utc::now(),
            )?;
            Ok(thread.id)
        }
    }

    #[derive(Default)]
    struct RecordingPush {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Push for RecordingPush {
        async fn notify(&self, notification: Notification) {
            self.sent.lock().unwrap().push(notification);
        }
    }

    struct ScriptedSkill {
        name: &'static str,
        result: SkillResult,
    }

    #[async_trait]
    impl Skill for ScriptedSkill {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "scripted"
        }
        fn config_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, _ctx: SkillContext) -> SkillResult {
            self.result.clone()
        }
    }

    struct CancelAwareSkill;

    #[async_trait]
    impl Skill for CancelAwareSkill {
        fn name(&self) -> &str {
            "waits"
        }
        fn description(&self) -> &str {
            "waits for cancellation"
        }
        fn config_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, ctx: SkillContext) -> SkillResult {
            ctx.cancel.cancelled().await;
            SkillResult::ok("Aborted")
        }
    }

    struct Fixture {
        store: Arc<Store>,
        push: Arc<RecordingPush>,
        runner: Arc<StubRunner>,
        scheduler: Scheduler,
    }

    fn fixture(fail_runner: bool) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut registry = SkillRegistry::new();
        registry.register(Arc::new(ScriptedSkill {
            name: "noop",
            result: SkillResult::ok("done"),
        }));
        registry.register(Arc::new(ScriptedSkill {
            name: "one-shot",
            result: SkillResult::ok_and_disable("done for good"),
        }));
        registry.register(Arc::new(ScriptedSkill {
            name: "broken",
            result: SkillResult::failed("sensor offline"),
        }));
        registry.register(Arc::new(CancelAwareSkill));

        let push = Arc::new(RecordingPush::default());
        let runner = Arc::new(StubRunner {
            store: store.clone(),
            calls: AtomicUsize::new(0),
            fail: fail_runner,
        });
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(registry),
            runner.clone(),
            push.clone(),
            Some("https://atlas.local".into()),
        );
        Fixture {
            store,
            push,
            runner,
            scheduler,
        }
    }

    fn at_eight() -> DateTime<Utc> {
        "2026-03-02T08:00:00Z".parse().unwrap()
    }

    fn insert_prompt_job(store: &Store, name: &str, max_retries: u32) -> Job {
        store
            .insert_job(
                &NewJob {
                    name: name.into(),
                    cron: Some("0 8 * * *".into()),
                    prompt: Some("status".into()),
                    skill_name: None,
                    skill_config: None,
                    enabled: true,
                    max_retries,
                    next_run_at: at_eight(),
                },
                at_eight() - Duration::days(1),
            )
            .unwrap()
    }

    fn insert_skill_job(store: &Store, skill: &str) -> Job {
        store
            .insert_job(
                &NewJob {
                    name: format!("{skill}-job"),
                    cron: None,
                    prompt: None,
                    skill_name: Some(skill.into()),
                    skill_config: Some(serde_json::json!({})),
                    enabled: true,
                    max_retries: 0,
                    next_run_at: at_eight(),
                },
                at_eight() - Duration::days(1),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn recurring_job_enqueues_then_executes_on_the_next_tick() {
        let f = fixture(false);
        let job = insert_prompt_job(&f.store, "morning", 0);

        // Tick at 08:00: the run is enqueued, not yet executed, and the
        // job's schedule moves past now.
        f.scheduler.tick(at_eight()).await.unwrap();
        let runs = f.store.list_runs(job.id).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Pending);
        assert_eq!(runs[0].scheduled_for, at_eight());
        let advanced = f.store.job(job.id).unwrap();
        assert!(advanced.next_run_at >= at_eight() + Duration::minutes(1));

        // Second tick claims and completes it.
        f.scheduler.tick(at_eight() + Duration::seconds(30)).await.unwrap();
        let run = &f.store.list_runs(job.id).unwrap()[0];
        assert_eq!(run.status, RunStatus::Completed);
        let thread_id = run.thread_id.expect("wake thread recorded");

        let thread = f.store.thread(thread_id).unwrap();
        assert_eq!(thread.source, ThreadSource::Wake);
        assert_eq!(thread.job_run_id, Some(run.id));
        assert!(f.store.job(job.id).unwrap().last_run_at.is_some());

        let sent = f.push.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "Job completed: morning");
        assert_eq!(sent[0].tag.as_deref(), Some("white_check_mark"));
        assert_eq!(
            sent[0].click_url.as_deref(),
            Some(format!("https://atlas.local/threads/{thread_id}").as_str())
        );
    }

    #[tokio::test]
    async fn duplicate_ticks_do_not_duplicate_runs() {
        let f = fixture(false);
        let job = insert_prompt_job(&f.store, "morning", 0);
        f.scheduler.tick(at_eight()).await.unwrap();
        // The job advanced past 08:00 so a replayed tick enqueues nothing new.
        f.scheduler.tick(at_eight()).await.unwrap();
        // Execution of the single run already happened in the replayed tick.
        assert_eq!(f.store.list_runs(job.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn abandoned_run_is_reclaimed_then_executed_exactly_once() {
        let f = fixture(false);
        let job = insert_prompt_job(&f.store, "morning", 0);
        // Keep the job itself out of the due set; this test is about the
        // orphaned run, not fresh enqueues.
        f.store
            .set_job_next_run(job.id, at_eight() + Duration::days(1), at_eight())
            .unwrap();
        let before = at_eight() - Duration::minutes(10);
        f.store.enqueue_run(job.id, before, before).unwrap();
        // Simulate a crashed executor: claim long ago so the lease expired.
        f.store.claim_pending_run(before).unwrap().unwrap();

        f.scheduler.tick(at_eight()).await.unwrap();
        let run = &f.store.list_runs(job.id).unwrap()[0];
        assert_eq!(run.status, RunStatus::Pending);

        f.scheduler.tick(at_eight() + Duration::seconds(30)).await.unwrap();
        let run = &f.store.list_runs(job.id).unwrap()[0];
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(f.runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_skill_fails_without_touching_the_agent() {
        let f = fixture(false);
        let job = insert_skill_job(&f.store, "noop");
        // Simulate a skill that was unregistered after the job was created.
        let mut stale = f.store.job(job.id).unwrap();
        stale.skill_name = Some("nope".into());
        f.store.update_job(&stale, at_eight()).unwrap();

        f.store.enqueue_run(job.id, at_eight(), at_eight()).unwrap();
        f.scheduler.tick(at_eight() + Duration::seconds(30)).await.unwrap();

        let run = &f.store.list_runs(job.id).unwrap()[0];
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("Unknown skill: nope"));
        assert_eq!(f.runner.calls.load(Ordering::SeqCst), 0);
        // max_retries 0 means the failure is terminal and notified.
        let sent = f.push.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].title.starts_with("Job failed:"));
        assert_eq!(sent[0].tag.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn one_shot_job_disables_after_firing() {
        let f = fixture(false);
        let job = insert_skill_job(&f.store, "noop");
        f.scheduler.tick(at_eight()).await.unwrap();
        assert!(!f.store.job(job.id).unwrap().enabled);
        assert_eq!(f.store.list_runs(job.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn skill_disable_request_is_honoured() {
        let f = fixture(false);
        let job = insert_skill_job(&f.store, "one-shot");
        f.store.enqueue_run(job.id, at_eight(), at_eight()).unwrap();
        f.scheduler.tick(at_eight() + Duration::seconds(30)).await.unwrap();

        let run = &f.store.list_runs(job.id).unwrap()[0];
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.thread_id.is_none());
        assert!(!f.store.job(job.id).unwrap().enabled);
        // Skills notify themselves; the engine stays quiet on success.
        assert!(f.push.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_with_retry_budget_requeues_with_backoff() {
        let f = fixture(true);
        let job = insert_prompt_job(&f.store, "flaky", 2);
        f.store.enqueue_run(job.id, at_eight(), at_eight()).unwrap();

        // First attempt fails and requeues behind a 30 s gate.
        f.scheduler.tick(at_eight() + Duration::seconds(30)).await.unwrap();
        let run = &f.store.list_runs(job.id).unwrap()[0];
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.retry_count, 1);
        assert!(run.locked_until.is_some());
        assert!(f.push.sent.lock().unwrap().is_empty());

        // Second attempt (after the backoff) exhausts the budget.
        f.scheduler
            .tick(at_eight() + Duration::minutes(20))
            .await
            .unwrap();
        let run = &f.store.list_runs(job.id).unwrap()[0];
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.retry_count, 2);
        let sent = f.push.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "Job failed: flaky");
    }

    #[tokio::test]
    async fn shutdown_signal_reaches_running_skills() {
        let f = fixture(false);
        let job = insert_skill_job(&f.store, "waits");
        f.store.enqueue_run(job.id, at_eight(), at_eight()).unwrap();

        // Cancel before the tick: the skill observes it immediately and
        // returns its cooperative "Aborted" success.
        f.scheduler.stop();
        f.scheduler.tick(at_eight() + Duration::seconds(30)).await.unwrap();
        let run = &f.store.list_runs(job.id).unwrap()[0];
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 5), "héllo");
        assert_eq!(truncate("short", 200), "short");
    }
}
