//! Job queue facade, worker loop and job handlers.

mod conversion;
mod enrich;
mod ingest;
mod worker;

pub use worker::Worker;

use crate::config::{ConversionConfig, LibraryConfig, WorkerConfig};
use crate::convert::Converter;
use crate::db::{Database, Job, JobStats, JobType, now_timestamp};
use crate::error::Result;
use crate::metadata::Waterfall;
use std::sync::Arc;
use tokio::sync::Notify;

/// Persisted job queue with in-process wakeups.
#[derive(Clone)]
pub struct JobQueue {
    db: Database,
    config: WorkerConfig,
    wakeup: Arc<Notify>,
}

impl JobQueue {
    /// Create a queue over the given database.
    pub fn new(db: Database, config: WorkerConfig) -> Self {
        Self {
            db,
            config,
            wakeup: Arc::new(Notify::new()),
        }
    }

    /// Underlying database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Worker settings.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Enqueue a job; `None` when one is already pending or leased for the target.
    ///
    /// A leased job is flagged to run again once it finishes.
    pub fn enqueue(&self, job_type: JobType, target_key: &str) -> Result<Option<Job>> {
        let job = self.db.enqueue_job(
            job_type,
            target_key,
            self.config.max_attempts.max(1),
            now_timestamp(),
        )?;
        match &job {
            Some(job) => {
                tracing::debug!(job_id = %job.id, job_type = %job_type, target = %target_key, "Job enqueued");
                self.wakeup.notify_one();
            }
            None => {
                tracing::trace!(job_type = %job_type, target = %target_key, "Job already queued");
            }
        }
        Ok(job)
    }

    /// Lease up to `limit` due jobs.
    pub fn claim_due(&self, limit: usize) -> Result<Vec<Job>> {
        self.db
            .claim_due_jobs(limit, self.config.lease_seconds, now_timestamp())
    }

    /// Mark a leased job done.
    pub fn complete(&self, job_id: &str) -> Result<bool> {
        self.db.complete_job(job_id, now_timestamp())
    }

    /// Record a failed attempt, re-arming with backoff or failing terminally.
    pub fn fail(&self, job_id: &str, error: &str) -> Result<Option<Job>> {
        self.db
            .fail_job(job_id, error, |attempts| self.config.backoff(attempts), now_timestamp())
    }

    /// Job counts per state.
    pub fn stats(&self) -> Result<JobStats> {
        self.db.job_stats()
    }

    /// Terminally failed jobs.
    pub fn failed(&self, limit: usize) -> Result<Vec<Job>> {
        self.db.failed_jobs(limit)
    }

    /// Re-arm one failed job.
    pub fn retry(&self, job_id: &str) -> Result<bool> {
        let rearmed = self.db.retry_job(job_id, now_timestamp())?;
        if rearmed {
            tracing::info!(job_id = %job_id, "Failed job re-armed");
            self.wakeup.notify_one();
        }
        Ok(rearmed)
    }

    /// Re-arm every failed job.
    pub fn retry_all_failed(&self) -> Result<usize> {
        let count = self.db.retry_failed_jobs(now_timestamp())?;
        if count > 0 {
            tracing::info!(count, "Failed jobs re-armed");
            self.wakeup.notify_one();
        }
        Ok(count)
    }

    /// Resolves when a job was enqueued since the last wakeup.
    pub(crate) async fn wait_for_work(&self) {
        self.wakeup.notified().await;
    }
}

/// Everything job handlers need besides the queue itself.
pub struct Pipeline {
    queue: JobQueue,
    waterfall: Arc<Waterfall>,
    converter: Arc<dyn Converter>,
    conversion: ConversionConfig,
    library: LibraryConfig,
}

impl Pipeline {
    /// Assemble the handler context.
    pub fn new(
        queue: JobQueue,
        waterfall: Arc<Waterfall>,
        converter: Arc<dyn Converter>,
        conversion: ConversionConfig,
        library: LibraryConfig,
    ) -> Self {
        Self {
            queue,
            waterfall,
            converter,
            conversion,
            library,
        }
    }

    /// The queue handlers enqueue follow-up work on.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Run the handler for one claimed job.
    pub async fn dispatch(&self, job: &Job) -> Result<()> {
        match job.job_type {
            JobType::Ingest => self.ingest(&job.target_key).await,
            JobType::Metadata => self.enrich(&job.target_key).await,
            JobType::Convert => self.convert(&job.target_key).await,
        }
    }
}
