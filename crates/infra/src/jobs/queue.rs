//! Job queue service: the operation surface over a [`JobStore`].
//!
//! Everything that changes job state goes through here so transitions are
//! logged in one place and store errors are mapped onto the queue taxonomy.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use commitpulse_core::DomainError;

use super::store::{JobStore, StoreError};
use super::types::{
    DEFAULT_MAX_ATTEMPTS, Job, JobDependency, JobFilter, JobId, JobStatus, JobUpdate, NewJob,
    QueueStats,
};

/// Queue service error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("dependency {job_id} -> {depends_on_id} would create a cycle")]
    Cycle { job_id: JobId, depends_on_id: JobId },
    /// Lost the race to claim a job. Callers move on to the next one.
    #[error("job {0} was already claimed")]
    ClaimConflict(JobId),
    /// Completed and failed jobs accept no further transitions.
    #[error("job {id} is already {status}")]
    Finished { id: JobId, status: JobStatus },
    #[error("store error: {0}")]
    Store(String),
}

impl From<StoreError> for QueueError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => QueueError::NotFound(id),
            StoreError::Cycle {
                job_id,
                depends_on_id,
            } => QueueError::Cycle {
                job_id,
                depends_on_id,
            },
            StoreError::AlreadyExists(id) => QueueError::Store(format!("job already exists: {id}")),
            StoreError::Storage(msg) => QueueError::Store(msg),
        }
    }
}

impl From<DomainError> for QueueError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => QueueError::Validation(msg),
            DomainError::Conflict(msg) => QueueError::Store(msg),
            DomainError::NotFound => QueueError::Store("entity not found".to_string()),
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Job queue service.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    default_max_attempts: u32,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Validate and persist a new pending job, together with the dependency
    /// edges named in `spec.depends_on`.
    pub async fn create_job(&self, mut spec: NewJob) -> QueueResult<Job> {
        let depends_on = std::mem::take(&mut spec.depends_on);
        let job = spec.into_job(self.default_max_attempts, Utc::now())?;
        let job = self.store.insert_with_dependencies(job, &depends_on).await?;

        info!(
            job_id = %job.id,
            job_type = %job.job_type(),
            priority = job.priority,
            scheduled_for = %job.scheduled_for,
            dependencies = depends_on.len(),
            "job created"
        );
        Ok(job)
    }

    pub async fn get_job(&self, id: JobId) -> QueueResult<Job> {
        self.store.get(id).await?.ok_or(QueueError::NotFound(id))
    }

    pub async fn get_jobs_by_filter(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        Ok(self.store.list(filter).await?)
    }

    /// Partial update of the mutable fields.
    pub async fn update_job(&self, id: JobId, update: &JobUpdate) -> QueueResult<Job> {
        if update.is_empty() {
            return self.get_job(id).await;
        }
        let job = self.store.update(id, update).await?;
        debug!(job_id = %id, status = %job.status, attempts = job.attempts, "job updated");
        Ok(job)
    }

    /// Delete a job and its edges.
    pub async fn delete_job(&self, id: JobId) -> QueueResult<()> {
        if !self.store.delete(id).await? {
            return Err(QueueError::NotFound(id));
        }
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    pub async fn get_ready_jobs(&self, limit: usize) -> QueueResult<Vec<Job>> {
        Ok(self.store.ready(Utc::now(), limit).await?)
    }

    /// Make `job_id` wait for `depends_on_id`.
    pub async fn add_job_dependency(
        &self,
        job_id: JobId,
        depends_on_id: JobId,
    ) -> QueueResult<JobDependency> {
        let edge = self
            .store
            .insert_dependency(job_id, depends_on_id)
            .await
            .inspect_err(|e| {
                if matches!(e, StoreError::Cycle { .. }) {
                    warn!(job_id = %job_id, depends_on_id = %depends_on_id, "dependency refused: cycle");
                }
            })?;

        debug!(job_id = %job_id, depends_on_id = %depends_on_id, "dependency added");
        Ok(edge)
    }

    pub async fn remove_job_dependency(&self, job_id: JobId, depends_on_id: JobId) -> QueueResult<()> {
        if !self.store.remove_dependency(job_id, depends_on_id).await? {
            return Err(QueueError::NotFound(depends_on_id));
        }
        debug!(job_id = %job_id, depends_on_id = %depends_on_id, "dependency removed");
        Ok(())
    }

    pub async fn get_job_dependencies(&self, job_id: JobId) -> QueueResult<Vec<JobDependency>> {
        Ok(self.store.dependencies(job_id).await?)
    }

    pub async fn get_queue_stats(&self) -> QueueResult<QueueStats> {
        Ok(self.store.stats().await?)
    }

    /// Atomic claim: `pending -> running`. Exactly one concurrent caller wins;
    /// the rest get [`QueueError::ClaimConflict`].
    pub async fn mark_job_as_running(&self, id: JobId) -> QueueResult<Job> {
        let claim = JobUpdate::new().status(JobStatus::Running);
        match self.store.update_if_status(id, JobStatus::Pending, &claim).await? {
            Some(job) => {
                debug!(job_id = %id, job_type = %job.job_type(), "job claimed");
                Ok(job)
            }
            None => Err(QueueError::ClaimConflict(id)),
        }
    }

    /// `running -> completed`, clearing error fields. `None` when the job is
    /// no longer running (e.g. failed externally while the handler ran).
    pub async fn mark_job_as_completed(
        &self,
        id: JobId,
        result: Option<JsonValue>,
    ) -> QueueResult<Option<Job>> {
        let update = JobUpdate::new()
            .status(JobStatus::Completed)
            .clear_error()
            .result(result);

        let job = self.store.update_if_status(id, JobStatus::Running, &update).await?;
        match &job {
            Some(job) => info!(job_id = %id, job_type = %job.job_type(), "job completed"),
            None => warn!(job_id = %id, "completion ignored: job is no longer running"),
        }
        Ok(job)
    }

    /// Terminal failure of a pending or running job, used for operator
    /// cancellation. Completed and failed jobs are refused with
    /// [`QueueError::Finished`].
    pub async fn mark_job_as_failed(
        &self,
        id: JobId,
        message: impl Into<String>,
        details: Option<JsonValue>,
    ) -> QueueResult<Job> {
        let message = message.into();
        let update = JobUpdate::new()
            .status(JobStatus::Failed)
            .error(message.clone(), details);

        // Retry the CAS when a processor moves the job between our read and write.
        loop {
            let current = self.get_job(id).await?;
            if current.status.is_terminal() {
                return Err(QueueError::Finished {
                    id,
                    status: current.status,
                });
            }

            if let Some(job) = self.store.update_if_status(id, current.status, &update).await? {
                warn!(
                    job_id = %id,
                    job_type = %job.job_type(),
                    attempts = job.attempts,
                    error = %message,
                    "job permanently failed"
                );
                return Ok(job);
            }
        }
    }

    /// Record a failed execution on a running job: the new attempt count and
    /// the error. `None` when the job is no longer running.
    pub async fn record_failed_attempt(
        &self,
        id: JobId,
        attempts: u32,
        message: impl Into<String>,
        details: Option<JsonValue>,
    ) -> QueueResult<Option<Job>> {
        let update = JobUpdate::new().attempts(attempts).error(message, details);
        let job = self.store.update_if_status(id, JobStatus::Running, &update).await?;
        if job.is_none() {
            warn!(job_id = %id, "failure ignored: job is no longer running");
        }
        Ok(job)
    }

    /// `running -> failed` with the final attempt count and error written in
    /// the same step. `None` when the job is no longer running.
    pub async fn fail_running_job(
        &self,
        id: JobId,
        attempts: u32,
        message: impl Into<String>,
        details: Option<JsonValue>,
    ) -> QueueResult<Option<Job>> {
        let message = message.into();
        let update = JobUpdate::new()
            .status(JobStatus::Failed)
            .attempts(attempts)
            .error(message.clone(), details);

        let job = self.store.update_if_status(id, JobStatus::Running, &update).await?;
        match &job {
            Some(job) => warn!(
                job_id = %id,
                job_type = %job.job_type(),
                attempts,
                error = %message,
                "job permanently failed"
            ),
            None => warn!(job_id = %id, "failure ignored: job is no longer running"),
        }
        Ok(job)
    }

    /// `running -> pending` with a new `scheduled_for`. The caller has already
    /// persisted the incremented attempt count. `None` when the job is no
    /// longer running.
    pub async fn schedule_retry(
        &self,
        id: JobId,
        next_attempt_at: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        let update = JobUpdate::new()
            .status(JobStatus::Pending)
            .scheduled_for(next_attempt_at);

        let job = self.store.update_if_status(id, JobStatus::Running, &update).await?;
        match &job {
            Some(job) => info!(
                job_id = %id,
                attempts = job.attempts,
                next_attempt_at = %next_attempt_at,
                "retry scheduled"
            ),
            None => warn!(job_id = %id, "retry ignored: job is no longer running"),
        }
        Ok(job)
    }

    /// Delete completed jobs not updated within `older_than`.
    pub async fn cleanup_completed_jobs(&self, older_than: Duration) -> QueueResult<u64> {
        let removed = self.store.delete_completed_before(cutoff(older_than)).await?;
        if removed > 0 {
            info!(removed, "completed jobs cleaned up");
        }
        Ok(removed)
    }

    /// Delete failed jobs, and pending jobs stuck behind them, not updated
    /// within `older_than`.
    pub async fn cleanup_expired_jobs(&self, older_than: Duration) -> QueueResult<u64> {
        let removed = self.store.delete_expired_before(cutoff(older_than)).await?;
        if removed > 0 {
            info!(removed, "expired jobs cleaned up");
        }
        Ok(removed)
    }

    /// Running jobs not touched within `threshold`.
    pub async fn get_stale_running_jobs(&self, threshold: Duration) -> QueueResult<Vec<Job>> {
        Ok(self.store.running_before(cutoff(threshold)).await?)
    }
}

fn cutoff(age: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    TimeDelta::from_std(age)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
