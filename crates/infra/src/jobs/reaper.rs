//! Stale-run reaper.
//!
//! Jobs left `running` past the liveness threshold are presumed orphaned by a
//! crashed worker and go through the ordinary failure path, so they are
//! retried (or failed) under the same `max_attempts` budget.

use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use super::processor::{FailureHandler, FailureOutcome, HandlerError};
use super::queue::{JobQueue, QueueResult};
use super::types::JobId;

/// Failure message recorded on reaped jobs.
pub const STALE_RUN_MESSAGE: &str = "stale running job recovered";

/// Result of one reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Returned to pending for another attempt
    pub retried: Vec<JobId>,
    /// Attempts exhausted
    pub failed: Vec<JobId>,
    /// Finished or changed status before the reaper got to them
    pub skipped: Vec<JobId>,
}

impl ReapReport {
    pub fn total(&self) -> usize {
        self.retried.len() + self.failed.len() + self.skipped.len()
    }
}

#[derive(Clone)]
pub struct StaleRunReaper {
    queue: JobQueue,
    failures: FailureHandler,
    threshold: Duration,
}

impl StaleRunReaper {
    pub fn new(queue: JobQueue, failures: FailureHandler, threshold: Duration) -> Self {
        Self {
            queue,
            failures,
            threshold,
        }
    }

    /// Recover every running job not updated within the threshold.
    pub async fn reap_once(&self) -> QueueResult<ReapReport> {
        let stale = self.queue.get_stale_running_jobs(self.threshold).await?;
        let mut report = ReapReport::default();
        if stale.is_empty() {
            return Ok(report);
        }

        warn!(count = stale.len(), threshold_secs = self.threshold.as_secs(), "reaping stale running jobs");

        let error = HandlerError::new(STALE_RUN_MESSAGE);
        for job in stale {
            match self.failures.handle_job_failure(job.id, &error).await {
                Ok(FailureOutcome::Retrying { .. }) => report.retried.push(job.id),
                Ok(FailureOutcome::Failed { .. }) => report.failed.push(job.id),
                Ok(FailureOutcome::Skipped) => report.skipped.push(job.id),
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "failed to reap stale job");
                    report.skipped.push(job.id);
                }
            }
        }

        info!(
            retried = report.retried.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "stale running jobs recovered"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::jobs::retry::RetryPolicy;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{FetchDiffData, JobPayload, JobStatus, NewJob};

    fn setup(threshold: Duration) -> (JobQueue, StaleRunReaper) {
        let queue = JobQueue::new(Arc::new(InMemoryJobStore::new()));
        let failures = FailureHandler::new(queue.clone(), RetryPolicy::default());
        let reaper = StaleRunReaper::new(queue.clone(), failures, threshold);
        (queue, reaper)
    }

    fn fetch_diff() -> NewJob {
        NewJob::new(JobPayload::FetchDiff(FetchDiffData {
            owner: "octo".into(),
            repo: "hello".into(),
            sha: "c0ffee00".into(),
            installation_id: None,
        }))
    }

    #[tokio::test]
    async fn fresh_running_jobs_are_left_alone() {
        let (queue, reaper) = setup(Duration::from_secs(600));
        let job = queue.create_job(fetch_diff()).await.unwrap();
        queue.mark_job_as_running(job.id).await.unwrap();

        let report = reaper.reap_once().await.unwrap();

        assert_eq!(report.total(), 0);
        assert_eq!(queue.get_job(job.id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn stale_job_is_returned_to_pending_with_message() {
        let (queue, reaper) = setup(Duration::ZERO);
        let job = queue.create_job(fetch_diff()).await.unwrap();
        queue.mark_job_as_running(job.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = reaper.reap_once().await.unwrap();

        assert_eq!(report.retried, vec![job.id]);
        let job = queue.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error_message.as_deref(), Some(STALE_RUN_MESSAGE));
    }

    #[tokio::test]
    async fn stale_job_on_last_attempt_is_failed() {
        let (queue, reaper) = setup(Duration::ZERO);
        let job = queue.create_job(fetch_diff().with_max_attempts(1)).await.unwrap();
        queue.mark_job_as_running(job.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = reaper.reap_once().await.unwrap();

        assert_eq!(report.failed, vec![job.id]);
        assert_eq!(queue.get_job(job.id).await.unwrap().status, JobStatus::Failed);
    }
}
