//! Digest email scheduling.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use commitpulse_core::ProjectId;

use super::commit::PipelineError;
use super::commits::CommitStore;
use crate::jobs::queue::JobQueue;
use crate::jobs::types::{EmailTemplate, Job, JobPayload, NewJob, SendEmailData};

pub const DIGEST_PRIORITY: i32 = 40;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestRequest {
    pub project_id: ProjectId,
    pub recipients: Vec<String>,
    /// Only commits recorded at or after this instant
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Delivery time; defaults to now
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DigestOutcome {
    NoEligibleCommits,
    Scheduled { job: Job, commit_count: usize },
}

#[derive(Clone)]
pub struct DigestScheduler {
    queue: JobQueue,
    commits: Arc<dyn CommitStore>,
}

impl DigestScheduler {
    pub fn new(queue: JobQueue, commits: Arc<dyn CommitStore>) -> Self {
        Self { queue, commits }
    }

    /// Create one digest email job covering every eligible commit, or none
    /// when nothing is eligible.
    pub async fn create_digest(&self, request: DigestRequest) -> Result<DigestOutcome, PipelineError> {
        let eligible = self
            .commits
            .digest_eligible(request.project_id, request.since)
            .await?;

        if eligible.is_empty() {
            debug!(project_id = %request.project_id, "no commits eligible for digest");
            return Ok(DigestOutcome::NoEligibleCommits);
        }

        let commit_ids: Vec<_> = eligible.iter().map(|c| c.id).collect();
        let commit_count = commit_ids.len();

        let job = self
            .queue
            .create_job(
                NewJob::new(JobPayload::SendEmail(SendEmailData {
                    recipients: request.recipients,
                    template: EmailTemplate::Digest,
                    commit_ids,
                    subject: request.subject,
                }))
                .with_priority(DIGEST_PRIORITY)
                .for_project(request.project_id)
                .scheduled_for(request.scheduled_for.unwrap_or_else(Utc::now)),
            )
            .await?;

        info!(
            project_id = %request.project_id,
            job_id = %job.id,
            commit_count,
            scheduled_for = %job.scheduled_for,
            "digest scheduled"
        );
        Ok(DigestOutcome::Scheduled { job, commit_count })
    }
}
