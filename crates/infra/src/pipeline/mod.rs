//! Commit processing pipeline built on the job system.
//!
//! - `admission`: credit check before any job is created
//! - `commit`: `fetch_diff -> generate_summary [-> send_email]` creation with
//!   compensating rollback
//! - `digest`: batched digest email scheduling
//! - `handlers`: job handlers and the upstream collaborators they call
//! - `commits`: commit artifact storage

pub mod admission;
pub mod commit;
pub mod commits;
pub mod digest;
pub mod handlers;

pub use admission::{AdmissionError, AdmissionGate, CreditLedger, InMemoryCreditLedger};
pub use commit::{CommitPipeline, CommitPipelineRequest, PipelineError, PipelineJobs};
pub use commits::{CommitRecord, CommitStore, CommitStoreError, InMemoryCommitStore};
pub use digest::{DigestOutcome, DigestRequest, DigestScheduler};
pub use handlers::{
    DiffProvider, DiffStatSummaryGenerator, DiffStats, EmailSender, FetchDiffHandler,
    GenerateSummaryHandler, LogEmailSender, OutgoingEmail, SendEmailHandler, SummaryGenerator,
    pipeline_handlers,
};
