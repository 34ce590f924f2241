//! Commit pipeline creation: admission, then `fetch_diff -> generate_summary
//! [-> send_email]` with dependency edges.
//!
//! Each dependent job is stored together with its edge, so it is never ready
//! ahead of its upstream job. Creation is all-or-nothing: if any job after
//! the first fails to persist, every job created so far is deleted before the
//! error is returned.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use commitpulse_core::{AccountId, CommitId, ProjectId};

use super::admission::{AdmissionError, AdmissionGate};
use super::commits::{CommitRecord, CommitStore, CommitStoreError};
use crate::jobs::queue::{JobQueue, QueueError};
use crate::jobs::types::{
    EmailTemplate, FetchDiffData, GenerateSummaryData, Job, JobId, JobPayload, NewJob, SendEmailData,
};

pub const FETCH_DIFF_PRIORITY: i32 = 70;
pub const GENERATE_SUMMARY_PRIORITY: i32 = 60;
pub const SEND_EMAIL_PRIORITY: i32 = 50;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Commits(#[from] CommitStoreError),
}

/// A pushed commit to process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitPipelineRequest {
    /// Account billed for the summary
    pub account_id: AccountId,
    pub project_id: ProjectId,
    #[serde(default)]
    pub commit_id: Option<CommitId>,
    pub owner: String,
    pub repo: String,
    pub sha: String,
    pub message: String,
    pub author: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub installation_id: Option<i64>,
    /// Send a per-commit summary email to these addresses once summarized
    #[serde(default)]
    pub notify: Vec<String>,
}

/// Jobs created for one commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineJobs {
    pub commit_id: CommitId,
    pub fetch_diff: Job,
    pub generate_summary: Job,
    pub send_email: Option<Job>,
}

#[derive(Clone)]
pub struct CommitPipeline {
    queue: JobQueue,
    admission: AdmissionGate,
    commits: Arc<dyn CommitStore>,
}

impl CommitPipeline {
    pub fn new(queue: JobQueue, admission: AdmissionGate, commits: Arc<dyn CommitStore>) -> Self {
        Self {
            queue,
            admission,
            commits,
        }
    }

    /// Admit the commit and create its jobs.
    pub async fn enqueue(&self, request: CommitPipelineRequest) -> Result<PipelineJobs, PipelineError> {
        self.admission.check(request.account_id).await?;

        let commit_id = request.commit_id.unwrap_or_default();
        let repository = format!("{}/{}", request.owner, request.repo);

        let inserted = self
            .commits
            .insert_if_absent(CommitRecord {
                id: commit_id,
                project_id: request.project_id,
                sha: request.sha.clone(),
                message: request.message.clone(),
                author: request.author.clone(),
                repository: repository.clone(),
                branch: request.branch.clone(),
                diff: None,
                summary: None,
                emailed_at: None,
                created_at: Utc::now(),
            })
            .await?;
        if !inserted {
            debug!(commit_id = %commit_id, "commit already tracked, keeping its artifacts");
        }

        let mut created = Vec::new();
        match self.create_jobs(&request, commit_id, repository, &mut created).await {
            Ok(jobs) => {
                info!(
                    commit_id = %commit_id,
                    project_id = %request.project_id,
                    sha = %request.sha,
                    jobs = created.len(),
                    "commit pipeline enqueued"
                );
                Ok(jobs)
            }
            Err(e) => {
                warn!(commit_id = %commit_id, error = %e, created = created.len(), "rolling back commit pipeline");
                self.rollback(&created).await;
                Err(e.into())
            }
        }
    }

    async fn create_jobs(
        &self,
        request: &CommitPipelineRequest,
        commit_id: CommitId,
        repository: String,
        created: &mut Vec<JobId>,
    ) -> Result<PipelineJobs, QueueError> {
        let scoped = |payload| {
            NewJob::new(payload)
                .for_project(request.project_id)
                .for_commit(commit_id)
        };

        let fetch_diff = self
            .queue
            .create_job(
                scoped(JobPayload::FetchDiff(FetchDiffData {
                    owner: request.owner.clone(),
                    repo: request.repo.clone(),
                    sha: request.sha.clone(),
                    installation_id: request.installation_id,
                }))
                .with_priority(FETCH_DIFF_PRIORITY),
            )
            .await?;
        created.push(fetch_diff.id);

        let generate_summary = self
            .queue
            .create_job(
                scoped(JobPayload::GenerateSummary(GenerateSummaryData {
                    sha: request.sha.clone(),
                    message: request.message.clone(),
                    author: request.author.clone(),
                    repository,
                    branch: request.branch.clone(),
                }))
                .with_priority(GENERATE_SUMMARY_PRIORITY)
                .depends_on(fetch_diff.id),
            )
            .await?;
        created.push(generate_summary.id);

        let send_email = if request.notify.is_empty() {
            None
        } else {
            let job = self
                .queue
                .create_job(
                    scoped(JobPayload::SendEmail(SendEmailData {
                        recipients: request.notify.clone(),
                        template: EmailTemplate::CommitSummary,
                        commit_ids: vec![commit_id],
                        subject: None,
                    }))
                    .with_priority(SEND_EMAIL_PRIORITY)
                    .depends_on(generate_summary.id),
                )
                .await?;
            created.push(job.id);
            Some(job)
        };

        Ok(PipelineJobs {
            commit_id,
            fetch_diff,
            generate_summary,
            send_email,
        })
    }

    /// Best effort: every id is attempted even if an earlier delete fails.
    async fn rollback(&self, created: &[JobId]) {
        for id in created.iter().rev() {
            match self.queue.delete_job(*id).await {
                Ok(()) | Err(QueueError::NotFound(_)) => {}
                Err(e) => error!(job_id = %id, error = %e, "failed to roll back pipeline job"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::store::test_support::ObservedStore;
    use crate::jobs::types::{JobFilter, JobStatus, JobType};
    use crate::pipeline::admission::InMemoryCreditLedger;
    use crate::pipeline::commits::InMemoryCommitStore;

    struct Fixture {
        queue: JobQueue,
        ledger: Arc<InMemoryCreditLedger>,
        pipeline: CommitPipeline,
    }

    fn fixture() -> Fixture {
        let queue = JobQueue::new(Arc::new(InMemoryJobStore::new()));
        let ledger = Arc::new(InMemoryCreditLedger::new());
        let gate = AdmissionGate::new(ledger.clone(), 1, "/billing");
        let pipeline = CommitPipeline::new(queue.clone(), gate, Arc::new(InMemoryCommitStore::new()));
        Fixture {
            queue,
            ledger,
            pipeline,
        }
    }

    fn request(account_id: AccountId) -> CommitPipelineRequest {
        CommitPipelineRequest {
            account_id,
            project_id: ProjectId::new(),
            commit_id: None,
            owner: "octo".into(),
            repo: "hello".into(),
            sha: "9f8e7d6c5b4a".into(),
            message: "Speed up ready query".into(),
            author: "mona".into(),
            branch: Some("main".into()),
            installation_id: Some(42),
            notify: vec![],
        }
    }

    #[tokio::test]
    async fn creates_linked_jobs_with_pipeline_priorities() {
        let fx = fixture();
        let account = AccountId::new();
        fx.ledger.set_balance(account, 10);

        let jobs = fx.pipeline.enqueue(request(account)).await.unwrap();

        assert_eq!(jobs.fetch_diff.priority, 70);
        assert_eq!(jobs.generate_summary.priority, 60);
        assert!(jobs.send_email.is_none());
        let deps = fx.queue.get_job_dependencies(jobs.generate_summary.id).await.unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].depends_on_job_id, jobs.fetch_diff.id);

        let ready = fx.queue.get_ready_jobs(10).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].job_type(), JobType::FetchDiff);
    }

    #[tokio::test]
    async fn dependents_are_never_ready_while_the_pipeline_is_built() {
        let store = Arc::new(ObservedStore::new());
        let queue = JobQueue::new(store.clone());
        let ledger = Arc::new(InMemoryCreditLedger::new());
        let account = AccountId::new();
        ledger.set_balance(account, 1);
        let pipeline = CommitPipeline::new(
            queue,
            AdmissionGate::new(ledger, 1, "/billing"),
            Arc::new(InMemoryCommitStore::new()),
        );
        let mut req = request(account);
        req.notify = vec!["dev@example.com".into()];

        pipeline.enqueue(req).await.unwrap();

        let snapshots = store.ready_snapshots();
        assert_eq!(snapshots.len(), 3);
        for ready in snapshots {
            let types: Vec<_> = ready.iter().map(|j| j.job_type()).collect();
            assert_eq!(types, vec![JobType::FetchDiff]);
        }
    }

    #[tokio::test]
    async fn notify_adds_email_behind_summary() {
        let fx = fixture();
        let account = AccountId::new();
        fx.ledger.set_balance(account, 1);
        let mut req = request(account);
        req.notify = vec!["dev@example.com".into()];

        let jobs = fx.pipeline.enqueue(req).await.unwrap();

        let email = jobs.send_email.unwrap();
        assert_eq!(email.priority, 50);
        let deps = fx.queue.get_job_dependencies(email.id).await.unwrap();
        assert_eq!(deps[0].depends_on_job_id, jobs.generate_summary.id);
    }

    #[tokio::test]
    async fn insufficient_credits_create_nothing() {
        let fx = fixture();

        let err = fx.pipeline.enqueue(request(AccountId::new())).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Admission(AdmissionError::InsufficientCredits { .. })
        ));
        assert_eq!(fx.queue.get_queue_stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn failure_after_first_job_rolls_back() {
        let fx = fixture();
        let account = AccountId::new();
        fx.ledger.set_balance(account, 1);
        let mut req = request(account);
        // fetch_diff does not carry the author, so only the second job is invalid.
        req.author = "  ".into();

        let err = fx.pipeline.enqueue(req).await.unwrap_err();

        assert!(matches!(err, PipelineError::Queue(QueueError::Validation(_))));
        let remaining = fx.queue.get_jobs_by_filter(&JobFilter::default()).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn invalid_recipient_rolls_back_whole_pipeline() {
        let fx = fixture();
        let account = AccountId::new();
        fx.ledger.set_balance(account, 1);
        let mut req = request(account);
        req.notify = vec!["not-an-address".into()];

        assert!(fx.pipeline.enqueue(req).await.is_err());

        let stats = fx.queue.get_queue_stats().await.unwrap();
        assert_eq!(stats.count_status(JobStatus::Pending), 0);
    }
}
