//! Dependency-aware background job system.
//!
//! ## Design
//!
//! - Jobs are typed (`fetch_diff`, `generate_summary`, `send_email`) and
//!   carry a validated payload per type
//! - Jobs wait on other jobs through an acyclic dependency graph
//! - Claims are an atomic `pending -> running` compare-and-set, so several
//!   processes can poll one store
//! - Failed executions retry with exponential backoff, or just past the
//!   upstream reset when the failure carries a rate-limit hint
//! - Jobs stuck in `running` are recovered by a reaper
//!
//! ## Components
//!
//! - `Job`: the job record and its typed payload
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `JobQueue`: creation, transitions, dependency edges, stats, cleanup
//! - `JobProcessor`: polls, claims and dispatches to registered handlers
//! - `StaleRunReaper`: recovers orphaned running jobs
//! - `JobSystem`: start/stop lifecycle for the background tasks

pub mod graph;
pub mod postgres;
pub mod processor;
pub mod queue;
pub mod reaper;
pub mod retry;
pub mod store;
pub mod system;
pub mod types;

pub use graph::{CycleDetected, DependencyGraph};
pub use postgres::PostgresJobStore;
pub use processor::{
    FailureHandler, FailureOutcome, HandlerError, HandlerRegistry, JobHandler, JobProcessor,
    ProcessorConfig, ProcessorStats,
};
pub use queue::{JobQueue, QueueError, QueueResult};
pub use reaper::{ReapReport, StaleRunReaper};
pub use retry::{RetryDecision, RetryPolicy, RetryReason};
pub use store::{InMemoryJobStore, JobStore, StoreError};
pub use system::{JobSystem, StartOutcome};
pub use types::{
    EmailTemplate, FetchDiffData, GenerateSummaryData, Job, JobDependency, JobFilter, JobId,
    JobPayload, JobStatus, JobType, JobUpdate, NewJob, QueueStats, SendEmailData,
};
