use super::Pipeline;
use crate::db::JobState;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// Claims due jobs and runs them one at a time.
pub struct Worker {
    pipeline: Arc<Pipeline>,
}

impl Worker {
    /// Create a worker over a handler pipeline.
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    /// Claim one batch and process it. Returns how many jobs were claimed.
    ///
    /// Handler errors are recorded on the job and never propagate.
    pub async fn run_once(&self) -> Result<usize> {
        let queue = self.pipeline.queue();
        let jobs = queue.claim_due(queue.config().batch_size.max(1))?;

        for job in &jobs {
            tracing::debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                target = %job.target_key,
                attempt = job.attempts,
                "Job claimed"
            );

            match self.pipeline.dispatch(job).await {
                Ok(()) => {
                    queue.complete(&job.id)?;
                    tracing::debug!(job_id = %job.id, job_type = %job.job_type, "Job completed");
                }
                Err(e) => {
                    let error = e.to_string();
                    match queue.fail(&job.id, &error)? {
                        Some(failed) if failed.state == JobState::Failed => tracing::error!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            target = %job.target_key,
                            attempts = failed.attempts,
                            error = %error,
                            "Job failed permanently"
                        ),
                        Some(retry) => tracing::warn!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            target = %job.target_key,
                            attempt = retry.attempts,
                            retry_at = retry.run_after,
                            error = %error,
                            "Job failed, will retry"
                        ),
                        None => tracing::warn!(job_id = %job.id, error = %error, "Job failed after losing its lease"),
                    }
                }
            }
        }

        Ok(jobs.len())
    }

    /// Process jobs forever, sleeping until woken by an enqueue or the poll interval.
    pub async fn run(self) {
        let queue = self.pipeline.queue().clone();
        let poll = Duration::from_secs(queue.config().poll_interval_seconds.max(1));
        tracing::info!(poll_secs = poll.as_secs(), "Job worker started");

        loop {
            match self.run_once().await {
                Ok(n) if n > 0 => continue,
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Job worker iteration failed"),
            }

            tokio::select! {
                _ = queue.wait_for_work() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }
}
