//! Job handlers for the commit pipeline and the collaborators they call.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info};

use commitpulse_core::CommitId;

use super::commits::{CommitRecord, CommitStore, CommitStoreError};
use crate::jobs::processor::{HandlerError, HandlerRegistry, JobHandler};
use crate::jobs::types::{
    EmailTemplate, FetchDiffData, GenerateSummaryData, Job, JobPayload, JobType, SendEmailData,
};

/// Upstream source of commit diffs.
#[async_trait]
pub trait DiffProvider: Send + Sync {
    async fn fetch_diff(&self, request: &FetchDiffData) -> Result<String, HandlerError>;
}

/// Turns a diff plus commit metadata into summary text.
#[async_trait]
pub trait SummaryGenerator: Send + Sync {
    async fn summarize(&self, commit: &GenerateSummaryData, diff: &str) -> Result<String, HandlerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingEmail {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), HandlerError>;
}

impl From<CommitStoreError> for HandlerError {
    fn from(err: CommitStoreError) -> Self {
        HandlerError::new(err.to_string())
    }
}

/// Line counts of a unified diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    pub files_changed: usize,
    pub additions: usize,
    pub deletions: usize,
}

impl DiffStats {
    pub fn from_diff(diff: &str) -> Self {
        let mut stats = DiffStats::default();
        for line in diff.lines() {
            if line.starts_with("diff --git ") {
                stats.files_changed += 1;
            } else if line.starts_with('+') && !line.starts_with("+++") {
                stats.additions += 1;
            } else if line.starts_with('-') && !line.starts_with("---") {
                stats.deletions += 1;
            }
        }
        stats
    }
}

fn wrong_payload(job: &Job, expected: JobType) -> HandlerError {
    HandlerError::new(format!(
        "job {} has type {}, expected {expected}",
        job.id,
        job.job_type()
    ))
}

fn require_commit(job: &Job) -> Result<CommitId, HandlerError> {
    job.commit_id
        .ok_or_else(|| HandlerError::new(format!("{} job {} has no commit", job.job_type(), job.id)))
}

/// Fetches a commit diff and stores it on the commit.
pub struct FetchDiffHandler {
    diffs: Arc<dyn DiffProvider>,
    commits: Arc<dyn CommitStore>,
}

impl FetchDiffHandler {
    pub fn new(diffs: Arc<dyn DiffProvider>, commits: Arc<dyn CommitStore>) -> Self {
        Self { diffs, commits }
    }
}

#[async_trait]
impl JobHandler for FetchDiffHandler {
    async fn handle(&self, job: &Job) -> Result<Option<JsonValue>, HandlerError> {
        let JobPayload::FetchDiff(data) = &job.payload else {
            return Err(wrong_payload(job, JobType::FetchDiff));
        };

        let diff = self.diffs.fetch_diff(data).await?;
        let stats = DiffStats::from_diff(&diff);

        if let Some(commit_id) = job.commit_id {
            self.commits.save_diff(commit_id, diff).await?;
        }

        debug!(job_id = %job.id, sha = %data.sha, files = stats.files_changed, "diff fetched");
        Ok(Some(json!({ "sha": data.sha, "stats": stats })))
    }
}

/// Summarizes the stored diff of a commit.
pub struct GenerateSummaryHandler {
    generator: Arc<dyn SummaryGenerator>,
    commits: Arc<dyn CommitStore>,
}

impl GenerateSummaryHandler {
    pub fn new(generator: Arc<dyn SummaryGenerator>, commits: Arc<dyn CommitStore>) -> Self {
        Self { generator, commits }
    }
}

#[async_trait]
impl JobHandler for GenerateSummaryHandler {
    async fn handle(&self, job: &Job) -> Result<Option<JsonValue>, HandlerError> {
        let JobPayload::GenerateSummary(data) = &job.payload else {
            return Err(wrong_payload(job, JobType::GenerateSummary));
        };
        let commit_id = require_commit(job)?;

        let commit = self
            .commits
            .get(commit_id)
            .await?
            .ok_or(CommitStoreError::NotFound(commit_id))?;
        let diff = commit
            .diff
            .ok_or_else(|| HandlerError::new(format!("commit {commit_id} has no diff yet")))?;

        let summary = self.generator.summarize(data, &diff).await?;
        let length = summary.len();
        self.commits.save_summary(commit_id, summary).await?;

        debug!(job_id = %job.id, commit_id = %commit_id, "summary generated");
        Ok(Some(json!({ "commit_id": commit_id, "summary_length": length })))
    }
}

/// Renders and delivers commit summary and digest emails.
pub struct SendEmailHandler {
    sender: Arc<dyn EmailSender>,
    commits: Arc<dyn CommitStore>,
}

impl SendEmailHandler {
    pub fn new(sender: Arc<dyn EmailSender>, commits: Arc<dyn CommitStore>) -> Self {
        Self { sender, commits }
    }

    async fn load(&self, ids: &[CommitId]) -> Result<Vec<CommitRecord>, HandlerError> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let record = self.commits.get(*id).await?.ok_or(CommitStoreError::NotFound(*id))?;
            records.push(record);
        }
        Ok(records)
    }
}

fn render(data: &SendEmailData, commits: &[CommitRecord]) -> OutgoingEmail {
    let subject = data.subject.clone().unwrap_or_else(|| match (data.template, commits) {
        (EmailTemplate::CommitSummary, [commit]) => {
            format!("[{}] {}", commit.repository, first_line(&commit.message))
        }
        (EmailTemplate::CommitSummary, _) => format!("{} commit summaries", commits.len()),
        (EmailTemplate::Digest, _) => format!("Commit digest: {} commits", commits.len()),
    });

    let body = commits
        .iter()
        .map(|c| {
            format!(
                "{} {} by {}\n{}\n",
                c.repository,
                c.sha.chars().take(7).collect::<String>(),
                c.author,
                c.summary.as_deref().unwrap_or("(no summary)")
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    OutgoingEmail {
        recipients: data.recipients.clone(),
        subject,
        body,
    }
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or_default()
}

#[async_trait]
impl JobHandler for SendEmailHandler {
    async fn handle(&self, job: &Job) -> Result<Option<JsonValue>, HandlerError> {
        let JobPayload::SendEmail(data) = &job.payload else {
            return Err(wrong_payload(job, JobType::SendEmail));
        };

        let commits = self.load(&data.commit_ids).await?;
        let email = render(data, &commits);
        self.sender.send(&email).await?;
        self.commits.mark_emailed(&data.commit_ids, Utc::now()).await?;

        Ok(Some(json!({
            "recipients": email.recipients.len(),
            "commits": commits.len(),
            "subject": email.subject,
        })))
    }
}

/// Deterministic summary built from diff statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffStatSummaryGenerator;

#[async_trait]
impl SummaryGenerator for DiffStatSummaryGenerator {
    async fn summarize(&self, commit: &GenerateSummaryData, diff: &str) -> Result<String, HandlerError> {
        let stats = DiffStats::from_diff(diff);
        let branch = commit
            .branch
            .as_deref()
            .map(|b| format!(" on {b}"))
            .unwrap_or_default();

        Ok(format!(
            "{} changed {} file{} (+{}/-{}) in {}{}: {}",
            commit.author,
            stats.files_changed,
            if stats.files_changed == 1 { "" } else { "s" },
            stats.additions,
            stats.deletions,
            commit.repository,
            branch,
            first_line(&commit.message)
        ))
    }
}

/// Logs deliveries instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), HandlerError> {
        info!(
            recipients = ?email.recipients,
            subject = %email.subject,
            body_len = email.body.len(),
            "email delivered"
        );
        Ok(())
    }
}

/// Registry with the three pipeline handlers wired to the given collaborators.
pub fn pipeline_handlers(
    diffs: Arc<dyn DiffProvider>,
    generator: Arc<dyn SummaryGenerator>,
    sender: Arc<dyn EmailSender>,
    commits: Arc<dyn CommitStore>,
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            JobType::FetchDiff,
            Arc::new(FetchDiffHandler::new(diffs, commits.clone())),
        )
        .register(
            JobType::GenerateSummary,
            Arc::new(GenerateSummaryHandler::new(generator, commits.clone())),
        )
        .register(JobType::SendEmail, Arc::new(SendEmailHandler::new(sender, commits)));
    registry
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    pub const SAMPLE_DIFF: &str = "\
diff --git a/src/lib.rs b/src/lib.rs
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,2 +1,3 @@
-fn old() {}
+fn new() {}
+fn another() {}
diff --git a/README.md b/README.md
--- a/README.md
+++ b/README.md
@@ -1 +1 @@
+docs
";

    /// Serves a fixed diff, or a fixed error.
    pub struct StaticDiffProvider(pub Result<String, HandlerError>);

    #[async_trait]
    impl DiffProvider for StaticDiffProvider {
        async fn fetch_diff(&self, _request: &FetchDiffData) -> Result<String, HandlerError> {
            self.0.clone()
        }
    }

    #[derive(Default)]
    pub struct RecordingEmailSender {
        pub sent: Mutex<Vec<OutgoingEmail>>,
    }

    #[async_trait]
    impl EmailSender for RecordingEmailSender {
        async fn send(&self, email: &OutgoingEmail) -> Result<(), HandlerError> {
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::jobs::types::NewJob;
    use crate::pipeline::commits::InMemoryCommitStore;
    use commitpulse_core::ProjectId;

    fn commit(project_id: ProjectId) -> CommitRecord {
        CommitRecord {
            id: CommitId::new(),
            project_id,
            sha: "0a1b2c3d4e5f".into(),
            message: "Handle rate limits\n\nLonger body".into(),
            author: "mona".into(),
            repository: "octo/hello".into(),
            branch: Some("main".into()),
            diff: None,
            summary: None,
            emailed_at: None,
            created_at: Utc::now(),
        }
    }

    fn job(payload: JobPayload, commit_id: CommitId) -> Job {
        NewJob::new(payload).for_commit(commit_id).into_job(3, Utc::now()).unwrap()
    }

    #[test]
    fn diff_stats_count_files_and_lines() {
        let stats = DiffStats::from_diff(SAMPLE_DIFF);
        assert_eq!(
            stats,
            DiffStats {
                files_changed: 2,
                additions: 3,
                deletions: 1
            }
        );
    }

    #[tokio::test]
    async fn fetch_then_summarize_stores_artifacts() {
        let commits = Arc::new(InMemoryCommitStore::new());
        let record = commit(ProjectId::new());
        commits.insert_if_absent(record.clone()).await.unwrap();

        let fetch = FetchDiffHandler::new(
            Arc::new(StaticDiffProvider(Ok(SAMPLE_DIFF.to_string()))),
            commits.clone(),
        );
        let fetch_job = job(
            JobPayload::FetchDiff(FetchDiffData {
                owner: "octo".into(),
                repo: "hello".into(),
                sha: record.sha.clone(),
                installation_id: None,
            }),
            record.id,
        );
        let result = fetch.handle(&fetch_job).await.unwrap().unwrap();
        assert_eq!(result["stats"]["files_changed"], 2);

        let summarize = GenerateSummaryHandler::new(Arc::new(DiffStatSummaryGenerator), commits.clone());
        let summary_job = job(
            JobPayload::GenerateSummary(GenerateSummaryData {
                sha: record.sha.clone(),
                message: record.message.clone(),
                author: "mona".into(),
                repository: "octo/hello".into(),
                branch: Some("main".into()),
            }),
            record.id,
        );
        summarize.handle(&summary_job).await.unwrap();

        let stored = commits.get(record.id).await.unwrap().unwrap();
        assert_eq!(
            stored.summary.as_deref(),
            Some("mona changed 2 files (+3/-1) in octo/hello on main: Handle rate limits")
        );
    }

    #[tokio::test]
    async fn summary_without_diff_fails() {
        let commits = Arc::new(InMemoryCommitStore::new());
        let record = commit(ProjectId::new());
        commits.insert_if_absent(record.clone()).await.unwrap();

        let handler = GenerateSummaryHandler::new(Arc::new(DiffStatSummaryGenerator), commits);
        let summary_job = job(
            JobPayload::GenerateSummary(GenerateSummaryData {
                sha: record.sha.clone(),
                message: record.message.clone(),
                author: "mona".into(),
                repository: "octo/hello".into(),
                branch: None,
            }),
            record.id,
        );

        let err = handler.handle(&summary_job).await.unwrap_err();
        assert!(err.message.contains("no diff"));
    }

    #[tokio::test]
    async fn digest_email_lists_summaries_and_marks_commits() {
        let commits = Arc::new(InMemoryCommitStore::new());
        let project = ProjectId::new();
        let mut a = commit(project);
        a.summary = Some("first".into());
        let mut b = commit(project);
        b.summary = Some("second".into());
        commits.insert_if_absent(a.clone()).await.unwrap();
        commits.insert_if_absent(b.clone()).await.unwrap();

        let sender = Arc::new(RecordingEmailSender::default());
        let handler = SendEmailHandler::new(sender.clone(), commits.clone());
        let email_job = job(
            JobPayload::SendEmail(SendEmailData {
                recipients: vec!["team@example.com".into()],
                template: EmailTemplate::Digest,
                commit_ids: vec![a.id, b.id],
                subject: None,
            }),
            a.id,
        );

        handler.handle(&email_job).await.unwrap();

        let sent = sender.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Commit digest: 2 commits");
        assert!(sent[0].body.contains("first") && sent[0].body.contains("second"));
        assert!(commits.digest_eligible(project, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upstream_failure_is_passed_through() {
        let commits = Arc::new(InMemoryCommitStore::new());
        let handler = FetchDiffHandler::new(
            Arc::new(StaticDiffProvider(Err(HandlerError::new("Resets at: 1700000000")))),
            commits,
        );
        let fetch_job = job(
            JobPayload::FetchDiff(FetchDiffData {
                owner: "octo".into(),
                repo: "hello".into(),
                sha: "abcdef0".into(),
                installation_id: None,
            }),
            CommitId::new(),
        );

        let err = handler.handle(&fetch_job).await.unwrap_err();
        assert_eq!(err.message, "Resets at: 1700000000");
    }
}
