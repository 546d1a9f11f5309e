use chrono::{DateTime, Duration, Utc};
use rusqlite::Row;
use tracing::debug;

use atlas_core::{Error, Result};

use crate::db::{opt_ts, parse_ts, ts, Store};
use crate::types::{Job, JobRun, NewJob, RunStatus};

/// Lease granted to a claimed run. A crashed executor's run becomes
/// reclaimable once this expires.
pub const RUN_LEASE: Duration = Duration::minutes(5);

const JOB_COLS: &str = "id, name, cron, prompt, skill_name, skill_config, enabled, \
                        max_retries, next_run_at, last_run_at, created_at, updated_at";
const RUN_COLS: &str = "id, job_id, scheduled_for, locked_until, status, retry_count, \
                        thread_id, error, started_at, completed_at, created_at";

impl Store {
    pub fn insert_job(&self, new: &NewJob, now: DateTime<Utc>) -> Result<Job> {
        let config_json = new
            .skill_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let db = self.db.lock().unwrap();
        let now_str = ts(now);
        db.execute(
            "INSERT INTO jobs
             (name, cron, prompt, skill_name, skill_config, enabled, max_retries,
              next_run_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            rusqlite::params![
                new.name,
                new.cron,
                new.prompt,
                new.skill_name,
                config_json,
                new.enabled,
                new.max_retries,
                ts(new.next_run_at),
                now_str,
            ],
        )?;
        let id = db.last_insert_rowid();
        debug!(job_id = id, name = %new.name, "job created");
        Ok(Job {
            id,
            name: new.name.clone(),
            cron: new.cron.clone(),
            prompt: new.prompt.clone(),
            skill_name: new.skill_name.clone(),
            skill_config: new.skill_config.clone(),
            enabled: new.enabled,
            max_retries: new.max_retries,
            next_run_at: new.next_run_at,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn job(&self, id: i64) -> Result<Job> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("SELECT {JOB_COLS} FROM jobs WHERE id = ?1 AND deleted_at IS NULL"),
            [id],
            row_to_job,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::not_found(format!("job {id}")),
            other => other.into(),
        })
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLS} FROM jobs
             WHERE deleted_at IS NULL
             ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], row_to_job)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Persist every mutable column of `job`. NotFound when the row is gone
    /// or soft-deleted.
    pub fn update_job(&self, job: &Job, now: DateTime<Utc>) -> Result<()> {
        let config_json = job
            .skill_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE jobs
             SET name = ?1, cron = ?2, prompt = ?3, skill_name = ?4, skill_config = ?5,
                 enabled = ?6, max_retries = ?7, next_run_at = ?8, updated_at = ?9
             WHERE id = ?10 AND deleted_at IS NULL",
            rusqlite::params![
                job.name,
                job.cron,
                job.prompt,
                job.skill_name,
                config_json,
                job.enabled,
                job.max_retries,
                ts(job.next_run_at),
                ts(now),
                job.id,
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found(format!("job {}", job.id)));
        }
        Ok(())
    }

    pub fn set_job_enabled(&self, id: i64, enabled: bool, now: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE jobs SET enabled = ?1, updated_at = ?2
             WHERE id = ?3 AND deleted_at IS NULL",
            rusqlite::params![enabled, ts(now), id],
        )?;
        if changed == 0 {
            return Err(Error::not_found(format!("job {id}")));
        }
        Ok(())
    }

    pub fn set_job_next_run(&self, id: i64, at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE jobs SET next_run_at = ?1, updated_at = ?2
             WHERE id = ?3 AND deleted_at IS NULL",
            rusqlite::params![ts(at), ts(now), id],
        )?;
        if changed == 0 {
            return Err(Error::not_found(format!("job {id}")));
        }
        Ok(())
    }

    pub fn set_job_last_run(&self, id: i64, at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE jobs SET last_run_at = ?1, updated_at = ?2
             WHERE id = ?3 AND deleted_at IS NULL",
            rusqlite::params![ts(at), ts(now), id],
        )?;
        if changed == 0 {
            return Err(Error::not_found(format!("job {id}")));
        }
        Ok(())
    }

    pub fn delete_job(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE jobs SET deleted_at = ?1, updated_at = ?1
             WHERE id = ?2 AND deleted_at IS NULL",
            rusqlite::params![ts(now), id],
        )?;
        if changed == 0 {
            return Err(Error::not_found(format!("job {id}")));
        }
        debug!(job_id = id, "job soft-deleted");
        Ok(())
    }

    /// Enabled, live jobs whose next fire time has arrived.
    pub fn jobs_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLS} FROM jobs
             WHERE enabled = 1 AND deleted_at IS NULL AND next_run_at <= ?1
             ORDER BY next_run_at ASC"
        ))?;
        let rows = stmt.query_map([ts(now)], row_to_job)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Idempotent enqueue of one nominal tick. Suppressed when the
    /// `(job_id, scheduled_for)` row already exists or another run of the
    /// same job is currently executing. Returns whether a row was inserted.
    pub fn enqueue_run(
        &self,
        job_id: i64,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let inserted = db.execute(
            "INSERT OR IGNORE INTO job_runs (job_id, scheduled_for, status, created_at)
             SELECT ?1, ?2, 'pending', ?3
             WHERE NOT EXISTS (
                 SELECT 1 FROM job_runs WHERE job_id = ?1 AND status = 'running'
             )",
            rusqlite::params![job_id, ts(scheduled_for), ts(now)],
        )?;
        Ok(inserted == 1)
    }

    pub fn run(&self, id: i64) -> Result<JobRun> {
        let db = self.db.lock().unwrap();
        db.query_row(
            &format!("SELECT {RUN_COLS} FROM job_runs WHERE id = ?1"),
            [id],
            row_to_run,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Error::not_found(format!("job run {id}")),
            other => other.into(),
        })
    }

    /// Run history for a job, most recent first.
    pub fn list_runs(&self, job_id: i64) -> Result<Vec<JobRun>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLS} FROM job_runs WHERE job_id = ?1 ORDER BY id DESC"
        ))?;
        let rows = stmt.query_map([job_id], row_to_run)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Atomically claim the oldest claimable pending run: mark it running,
    /// stamp `started_at` and grant the lease. Pending rows still inside a
    /// retry backoff window (`locked_until` in the future) are skipped.
    pub fn claim_pending_run(&self, now: DateTime<Utc>) -> Result<Option<JobRun>> {
        let db = self.db.lock().unwrap();
        let now_str = ts(now);
        let lease = ts(now + RUN_LEASE);
        let claimed = db.query_row(
            &format!(
                "UPDATE job_runs
                 SET status = 'running', started_at = ?1, locked_until = ?2
                 WHERE id = (
                     SELECT id FROM job_runs
                     WHERE status = 'pending'
                       AND (locked_until IS NULL OR locked_until <= ?1)
                     ORDER BY id ASC
                     LIMIT 1
                 )
                 RETURNING {RUN_COLS}"
            ),
            rusqlite::params![now_str, lease],
            row_to_run,
        );
        match claimed {
            Ok(run) => {
                debug!(run_id = run.id, job_id = run.job_id, "run claimed");
                Ok(Some(run))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Extend the lease of a still-running run.
    pub fn refresh_run_lock(&self, run_id: i64, now: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE job_runs SET locked_until = ?1
             WHERE id = ?2 AND status = 'running'",
            rusqlite::params![ts(now + RUN_LEASE), run_id],
        )?;
        Ok(())
    }

    /// Crash recovery: running rows whose lease expired go back to pending.
    /// Returns how many rows were reclaimed.
    pub fn reset_abandoned_runs(&self, now: DateTime<Utc>) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let reclaimed = db.execute(
            "UPDATE job_runs SET status = 'pending', locked_until = NULL
             WHERE status = 'running' AND locked_until < ?1",
            [ts(now)],
        )?;
        Ok(reclaimed)
    }

    pub fn complete_run(
        &self,
        run_id: i64,
        thread_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE job_runs
             SET status = 'completed', completed_at = ?1, thread_id = ?2, locked_until = NULL
             WHERE id = ?3",
            rusqlite::params![ts(now), thread_id, run_id],
        )?;
        if changed == 0 {
            return Err(Error::not_found(format!("job run {run_id}")));
        }
        debug!(run_id, "run completed");
        Ok(())
    }

    /// Terminal failure: record the error, bump the retry counter, clear the
    /// lease.
    pub fn fail_run(&self, run_id: i64, error: &str, now: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE job_runs
             SET status = 'failed', completed_at = ?1, error = ?2,
                 retry_count = retry_count + 1, locked_until = NULL
             WHERE id = ?3",
            rusqlite::params![ts(now), error, run_id],
        )?;
        if changed == 0 {
            return Err(Error::not_found(format!("job run {run_id}")));
        }
        debug!(run_id, error, "run failed");
        Ok(())
    }

    /// Retryable failure: back to pending with a backoff gate in
    /// `locked_until`, error and retry counter recorded.
    pub fn requeue_run(
        &self,
        run_id: i64,
        error: &str,
        backoff_until: DateTime<Utc>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE job_runs
             SET status = 'pending', locked_until = ?1, error = ?2,
                 retry_count = retry_count + 1, completed_at = NULL
             WHERE id = ?3",
            rusqlite::params![ts(backoff_until), error, run_id],
        )?;
        if changed == 0 {
            return Err(Error::not_found(format!("job run {run_id}")));
        }
        debug!(run_id, error, "run requeued for retry");
        Ok(())
    }
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let config_json: Option<String> = row.get(5)?;
    let skill_config = config_json.and_then(|s| serde_json::from_str(&s).ok());
    let next_run: String = row.get(8)?;
    let created: String = row.get(10)?;
    let updated: String = row.get(11)?;
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        cron: row.get(2)?,
        prompt: row.get(3)?,
        skill_name: row.get(4)?,
        skill_config,
        enabled: row.get(6)?,
        max_retries: row.get(7)?,
        next_run_at: parse_ts(&next_run),
        last_run_at: opt_ts(row.get(9)?),
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<JobRun> {
    let status_str: String = row.get(4)?;
    let scheduled: String = row.get(2)?;
    let created: String = row.get(10)?;
    Ok(JobRun {
        id: row.get(0)?,
        job_id: row.get(1)?,
        scheduled_for: parse_ts(&scheduled),
        locked_until: opt_ts(row.get(3)?),
        status: status_str.parse().unwrap_or(RunStatus::Pending),
        retry_count: row.get(5)?,
        thread_id: row.get(6)?,
        error: row.get(7)?,
        started_at: opt_ts(row.get(8)?),
        completed_at: opt_ts(row.get(9)?),
        created_at: parse_ts(&created),
    })
}
