//! Job processor: polls ready jobs, claims them, and dispatches to handlers.
//!
//! ## Failure path
//!
//! Every failed execution goes through [`FailureHandler::handle_job_failure`]:
//!
//! 1. If `attempts + 1` reaches `max_attempts`, write the count, the error and
//!    `failed` in one step (terminal).
//! 2. Otherwise persist `attempts + 1` with the error, ask the [`RetryPolicy`]
//!    for the next attempt time and put the job back to pending.
//!
//! Each write is conditional on the job still being `running`, so a job
//! failed or cancelled externally while its handler ran is left untouched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::queue::{JobQueue, QueueError, QueueResult};
use super::retry::{RetryPolicy, RetryReason};
use super::types::{Job, JobId, JobStatus, JobType};

/// Failure reported by a job handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    /// Structured context stored in `error_details`
    pub details: Option<JsonValue>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }
}

/// Executes one job type.
///
/// Receives the claimed job and returns an optional result document, or a
/// descriptive failure.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Option<JsonValue>, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&Job) -> Result<Option<JsonValue>, HandlerError> + Send + Sync,
{
    async fn handle(&self, job: &Job) -> Result<Option<JsonValue>, HandlerError> {
        (self.0)(job)
    }
}

/// `{type -> handler}` map supplied to the processor at construction.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(job_type, handler);
        self
    }

    /// Register a synchronous closure.
    pub fn register_fn<F>(&mut self, job_type: JobType, handler: F) -> &mut Self
    where
        F: Fn(&Job) -> Result<Option<JsonValue>, HandlerError> + Send + Sync + 'static,
    {
        self.register(job_type, Arc::new(FnHandler(handler)))
    }

    pub fn get(&self, job_type: JobType) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(&job_type)
    }

    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<_> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

/// What the failure path did with a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Attempts remain; the job is pending again.
    Retrying {
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        reason: RetryReason,
    },
    /// Attempts exhausted; the job is failed.
    Failed { attempts: u32 },
    /// The job was no longer running; nothing was changed.
    Skipped,
}

/// Shared failure path for the processor and the stale-run reaper.
#[derive(Clone)]
pub struct FailureHandler {
    queue: JobQueue,
    policy: RetryPolicy,
}

impl FailureHandler {
    pub fn new(queue: JobQueue, policy: RetryPolicy) -> Self {
        Self { queue, policy }
    }

    /// Record a failed execution and either schedule a retry or fail the job.
    pub async fn handle_job_failure(
        &self,
        id: JobId,
        error: &HandlerError,
    ) -> QueueResult<FailureOutcome> {
        let current = self.queue.get_job(id).await?;
        if current.status != JobStatus::Running {
            debug!(job_id = %id, status = %current.status, "failure ignored: job is no longer running");
            return Ok(FailureOutcome::Skipped);
        }

        let attempts = current.attempts.saturating_add(1);

        // Every write below is conditional on `running`, so an external
        // cancellation that lands after the read above wins.
        if self.policy.is_exhausted(attempts, current.max_attempts) {
            let failed = self
                .queue
                .fail_running_job(id, attempts, error.message.clone(), error.details.clone())
                .await?;
            return Ok(match failed {
                Some(_) => FailureOutcome::Failed { attempts },
                None => FailureOutcome::Skipped,
            });
        }

        let recorded = self
            .queue
            .record_failed_attempt(id, attempts, error.message.clone(), error.details.clone())
            .await?;
        if recorded.is_none() {
            return Ok(FailureOutcome::Skipped);
        }

        let decision = self
            .policy
            .next_attempt(current.attempts, &error.message, Utc::now());

        match self.queue.schedule_retry(id, decision.next_attempt_at).await? {
            Some(_) => {
                info!(
                    job_id = %id,
                    job_type = %current.job_type(),
                    attempts,
                    max_attempts = current.max_attempts,
                    next_attempt_at = %decision.next_attempt_at,
                    reason = ?decision.reason,
                    error = %error.message,
                    "job failed, will retry"
                );
                Ok(FailureOutcome::Retrying {
                    attempts,
                    next_attempt_at: decision.next_attempt_at,
                    reason: decision.reason,
                })
            }
            None => Ok(FailureOutcome::Skipped),
        }
    }
}

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// How long to wait when no job was ready
    pub poll_interval: Duration,
    /// `getReadyJobs` limit per poll
    pub batch_size: usize,
    /// Name for logging
    pub name: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_size: 10,
            name: "job-processor".to_string(),
        }
    }
}

impl ProcessorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Processor runtime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub claim_conflicts: u64,
}

/// Polling job processor.
pub struct JobProcessor {
    queue: JobQueue,
    handlers: HandlerRegistry,
    failures: FailureHandler,
    config: ProcessorConfig,
    stats: Arc<Mutex<ProcessorStats>>,
}

impl JobProcessor {
    pub fn new(queue: JobQueue, handlers: HandlerRegistry, config: ProcessorConfig) -> Self {
        let failures = FailureHandler::new(queue.clone(), RetryPolicy::default());
        Self {
            queue,
            handlers,
            failures,
            config,
            stats: Arc::new(Mutex::new(ProcessorStats::default())),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.failures = FailureHandler::new(self.queue.clone(), policy);
        self
    }

    pub fn failure_handler(&self) -> &FailureHandler {
        &self.failures
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, f: impl FnOnce(&mut ProcessorStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    /// Fetch one batch of ready jobs and run each one this worker manages to
    /// claim. Returns how many jobs were executed.
    pub async fn poll_once(&self) -> QueueResult<usize> {
        let ready = self.queue.get_ready_jobs(self.config.batch_size).await?;
        let mut executed = 0;

        for candidate in ready {
            let job = match self.queue.mark_job_as_running(candidate.id).await {
                Ok(job) => job,
                Err(QueueError::ClaimConflict(id)) => {
                    debug!(processor = %self.config.name, job_id = %id, "claim lost, skipping");
                    self.record(|s| s.claim_conflicts += 1);
                    continue;
                }
                Err(e) => {
                    error!(processor = %self.config.name, job_id = %candidate.id, error = %e, "failed to claim job");
                    continue;
                }
            };

            if let Err(e) = self.execute(&job).await {
                error!(processor = %self.config.name, job_id = %job.id, error = %e, "failed to record job outcome");
            }
            executed += 1;
        }

        Ok(executed)
    }

    /// Run a claimed job and record its outcome.
    pub async fn execute(&self, job: &Job) -> QueueResult<()> {
        self.record(|s| s.processed += 1);

        let Some(handler) = self.handlers.get(job.job_type()) else {
            let message = format!("no handler registered for job type: {}", job.job_type());
            warn!(job_id = %job.id, job_type = %job.job_type(), "no handler for job");
            if self.queue.fail_running_job(job.id, job.attempts, message, None).await?.is_some() {
                self.record(|s| s.failed += 1);
            }
            return Ok(());
        };

        debug!(processor = %self.config.name, job_id = %job.id, job_type = %job.job_type(), "executing job");

        match handler.handle(job).await {
            Ok(result) => {
                if self.queue.mark_job_as_completed(job.id, result).await?.is_some() {
                    self.record(|s| s.succeeded += 1);
                }
            }
            Err(err) => match self.failures.handle_job_failure(job.id, &err).await? {
                FailureOutcome::Retrying { .. } => self.record(|s| s.retried += 1),
                FailureOutcome::Failed { .. } => self.record(|s| s.failed += 1),
                FailureOutcome::Skipped => {}
            },
        }
        Ok(())
    }

    /// Poll until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(processor = %self.config.name, "job processor started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.poll_once().await {
                Ok(executed) => executed == 0,
                Err(e) => {
                    error!(processor = %self.config.name, error = %e, "failed to fetch ready jobs");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!(processor = %self.config.name, "job processor stopped");
    }
}
