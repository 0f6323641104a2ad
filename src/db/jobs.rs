//! Persisted job queue operations.

use super::schema::Database;
use super::{Job, JobState, JobType};
use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

const JOB_COLUMNS: &str = "id, job_type, target_key, state, attempts, max_attempts, last_error,
    lease_expires_at, run_after, created_at, updated_at";

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    /// Waiting jobs (including those in backoff).
    pub pending: i64,
    /// Jobs currently leased.
    pub leased: i64,
    /// Finished jobs.
    pub done: i64,
    /// Terminally failed jobs.
    pub failed: i64,
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let job_type: String = row.get(1)?;
    let state: String = row.get(3)?;
    Ok(Job {
        id: row.get(0)?,
        job_type: JobType::parse(&job_type).unwrap_or(JobType::Ingest),
        target_key: row.get(2)?,
        state: JobState::parse(&state).unwrap_or(JobState::Failed),
        attempts: row.get(4)?,
        max_attempts: row.get(5)?,
        last_error: row.get(6)?,
        lease_expires_at: row.get(7)?,
        run_after: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn load_job(conn: &Connection, id: &str) -> Result<Option<Job>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![id],
            row_to_job,
        )
        .optional()?)
}

/// Re-arm one failed job unless another active job already covers its target.
fn rearm_failed(conn: &Connection, id: &str, now: i64) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE jobs SET state = 'pending', attempts = 0, run_after = ?2, updated_at = ?2
         WHERE id = ?1 AND state = 'failed'
           AND NOT EXISTS (
               SELECT 1 FROM jobs AS active
               WHERE active.job_type = jobs.job_type
                 AND active.target_key = jobs.target_key
                 AND active.state IN ('pending', 'leased')
           )",
        params![id, now],
    )?;
    Ok(rows > 0)
}

impl Database {
    /// Insert a pending job unless one is already pending or leased for the same target.
    ///
    /// A leased job for the target is flagged instead, so it runs once more after it
    /// finishes and sees the latest input.
    pub fn enqueue_job(
        &self,
        job_type: JobType,
        target_key: &str,
        max_attempts: u32,
        now: i64,
    ) -> Result<Option<Job>> {
        self.write(|tx| {
            let id = uuid::Uuid::new_v4().to_string();
            let rows = tx.execute(
                "INSERT OR IGNORE INTO jobs
                 (id, job_type, target_key, state, attempts, max_attempts, run_after,
                  created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?5, ?5)",
                params![id, job_type.as_str(), target_key, max_attempts, now],
            )?;
            if rows == 0 {
                tx.execute(
                    "UPDATE jobs SET rerun = 1, updated_at = ?3
                     WHERE job_type = ?1 AND target_key = ?2 AND state = 'leased'",
                    params![job_type.as_str(), target_key, now],
                )?;
                return Ok(None);
            }
            load_job(tx, &id)
        })
    }

    /// Lease up to `limit` due jobs.
    ///
    /// A job is due when it is pending past its backoff, or leased past its deadline.
    /// Expired leases that already used every attempt become terminally failed.
    pub fn claim_due_jobs(&self, limit: usize, lease_seconds: i64, now: i64) -> Result<Vec<Job>> {
        self.write(|tx| {
            let expired = tx.execute(
                "UPDATE jobs SET state = 'failed', lease_expires_at = NULL, updated_at = ?1,
                        last_error = 'lease expired after ' || attempts || ' attempts'
                 WHERE state = 'leased' AND lease_expires_at <= ?1 AND attempts >= max_attempts",
                params![now],
            )?;
            if expired > 0 {
                tracing::warn!(count = expired, "Jobs failed after lease expiry");
            }

            let candidates: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM jobs
                     WHERE (state = 'pending' AND run_after <= ?1)
                        OR (state = 'leased' AND lease_expires_at <= ?1)
                     ORDER BY run_after, created_at
                     LIMIT ?2",
                )?;
                let limit = i64::try_from(limit).unwrap_or(i64::MAX);
                stmt.query_map(params![now, limit], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };

            let lease_deadline = now + lease_seconds;
            let mut claimed = Vec::with_capacity(candidates.len());
            for id in candidates {
                let rows = tx.execute(
                    "UPDATE jobs SET state = 'leased', attempts = attempts + 1,
                            lease_expires_at = ?2, updated_at = ?3
                     WHERE id = ?1
                       AND ((state = 'pending' AND run_after <= ?3)
                         OR (state = 'leased' AND lease_expires_at <= ?3))",
                    params![id, lease_deadline, now],
                )?;
                if rows == 1
                    && let Some(job) = load_job(tx, &id)?
                {
                    claimed.push(job);
                }
            }
            Ok(claimed)
        })
    }

    /// Mark a leased job done, or re-arm it when its target changed meanwhile.
    pub fn complete_job(&self, id: &str, now: i64) -> Result<bool> {
        self.write(|tx| {
            let rows = tx.execute(
                "UPDATE jobs SET
                     state = CASE WHEN rerun = 1 THEN 'pending' ELSE 'done' END,
                     attempts = CASE WHEN rerun = 1 THEN 0 ELSE attempts END,
                     run_after = CASE WHEN rerun = 1 THEN ?2 ELSE run_after END,
                     rerun = 0, lease_expires_at = NULL, updated_at = ?2
                 WHERE id = ?1 AND state = 'leased'",
                params![id, now],
            )?;
            Ok(rows > 0)
        })
    }

    /// Record a failed attempt.
    ///
    /// The job goes back to pending after `backoff(attempts)` seconds, or becomes
    /// terminally failed once its attempts are exhausted.
    pub fn fail_job(
        &self,
        id: &str,
        error: &str,
        backoff: impl Fn(u32) -> i64,
        now: i64,
    ) -> Result<Option<Job>> {
        self.write(|tx| {
            let Some(job) = load_job(tx, id)? else {
                return Ok(None);
            };
            if job.state != JobState::Leased {
                return Ok(None);
            }

            if job.attempts >= job.max_attempts {
                // A change seen during the last attempt earns a fresh set of attempts
                tx.execute(
                    "UPDATE jobs SET last_error = ?2, lease_expires_at = NULL, updated_at = ?3,
                            state = CASE WHEN rerun = 1 THEN 'pending' ELSE 'failed' END,
                            attempts = CASE WHEN rerun = 1 THEN 0 ELSE attempts END,
                            run_after = CASE WHEN rerun = 1 THEN ?3 ELSE run_after END,
                            rerun = 0
                     WHERE id = ?1",
                    params![id, error, now],
                )?;
            } else {
                tx.execute(
                    "UPDATE jobs SET state = 'pending', last_error = ?2, rerun = 0,
                            lease_expires_at = NULL, run_after = ?3, updated_at = ?4
                     WHERE id = ?1",
                    params![id, error, now + backoff(job.attempts), now],
                )?;
            }
            load_job(tx, id)
        })
    }

    /// Get job by ID.
    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.read(|tx| load_job(tx, id))
    }

    /// Non-terminal jobs for a target.
    pub fn active_jobs_for(&self, job_type: JobType, target_key: &str) -> Result<Vec<Job>> {
        self.read(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM jobs
                 WHERE job_type = ?1 AND target_key = ?2 AND state IN ('pending', 'leased')",
                JOB_COLUMNS
            ))?;
            let jobs = stmt
                .query_map(params![job_type.as_str(), target_key], row_to_job)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(jobs)
        })
    }

    /// Job counts per state.
    pub fn job_stats(&self) -> Result<JobStats> {
        self.read(|tx| {
            let mut stats = JobStats::default();
            let mut stmt = tx.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (state, count) = row?;
                match JobState::parse(&state) {
                    Some(JobState::Pending) => stats.pending = count,
                    Some(JobState::Leased) => stats.leased = count,
                    Some(JobState::Done) => stats.done = count,
                    Some(JobState::Failed) => stats.failed = count,
                    None => {}
                }
            }
            Ok(stats)
        })
    }

    /// Terminally failed jobs, most recent first.
    pub fn failed_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        self.read(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM jobs WHERE state = 'failed' ORDER BY updated_at DESC LIMIT ?1",
                JOB_COLUMNS
            ))?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let jobs = stmt
                .query_map(params![limit], row_to_job)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(jobs)
        })
    }

    /// Re-arm a terminally failed job with fresh attempts.
    pub fn retry_job(&self, id: &str, now: i64) -> Result<bool> {
        self.write(|tx| rearm_failed(tx, id, now))
    }

    /// Re-arm every terminally failed job; returns how many were re-armed.
    pub fn retry_failed_jobs(&self, now: i64) -> Result<usize> {
        self.write(|tx| {
            let ids: Vec<String> = {
                let mut stmt =
                    tx.prepare("SELECT id FROM jobs WHERE state = 'failed' ORDER BY updated_at DESC")?;
                stmt.query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?
            };
            let mut count = 0;
            for id in ids {
                if rearm_failed(tx, &id, now)? {
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    /// Delete finished jobs last updated before `before`.
    pub fn purge_done_jobs(&self, before: i64) -> Result<usize> {
        self.write(|tx| {
            Ok(tx.execute(
                "DELETE FROM jobs WHERE state = 'done' AND updated_at < ?1",
                params![before],
            )?)
        })
    }
}
