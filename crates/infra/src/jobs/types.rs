//! Core job types: the job record, its typed payload, and query shapes.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use commitpulse_core::{CommitId, DomainError, DomainResult, ProjectId};

pub use commitpulse_core::JobId;

/// Attempts allowed when a job does not specify its own limit.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Upper bound accepted for `max_attempts` at creation.
pub const MAX_ALLOWED_ATTEMPTS: u32 = 25;

/// Job type tag used to route a job to its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Fetch the diff of a commit from the upstream API.
    FetchDiff,
    /// Produce an AI summary of a fetched diff.
    GenerateSummary,
    /// Deliver a summary or digest email.
    SendEmail,
}

impl JobType {
    pub const ALL: [JobType; 3] = [JobType::FetchDiff, JobType::GenerateSummary, JobType::SendEmail];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FetchDiff => "fetch_diff",
            JobType::GenerateSummary => "generate_summary",
            JobType::SendEmail => "send_email",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unrecognized job type: {s}")))
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its scheduled time and dependencies
    Pending,
    /// Claimed by a processor
    Running,
    /// Finished successfully
    Completed,
    /// Attempts exhausted (or failed externally)
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unrecognized job status: {s}")))
    }
}

/// Email template selector for `send_email` jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailTemplate {
    CommitSummary,
    Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchDiffData {
    pub owner: String,
    pub repo: String,
    pub sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateSummaryData {
    pub sha: String,
    pub message: String,
    pub author: String,
    /// `owner/repo`
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEmailData {
    pub recipients: Vec<String>,
    pub template: EmailTemplate,
    pub commit_ids: Vec<CommitId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

/// Type-tagged job payload. Serialized as `{"type": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobPayload {
    FetchDiff(FetchDiffData),
    GenerateSummary(GenerateSummaryData),
    SendEmail(SendEmailData),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::FetchDiff(_) => JobType::FetchDiff,
            JobPayload::GenerateSummary(_) => JobType::GenerateSummary,
            JobPayload::SendEmail(_) => JobType::SendEmail,
        }
    }

    /// Build a payload from an untyped `(type, data)` pair, validating both.
    pub fn from_parts(job_type: &str, data: JsonValue) -> DomainResult<Self> {
        let job_type: JobType = job_type.parse()?;
        let invalid = |e: serde_json::Error| {
            DomainError::validation(format!("invalid {job_type} data: {e}"))
        };

        let payload = match job_type {
            JobType::FetchDiff => JobPayload::FetchDiff(serde_json::from_value(data).map_err(invalid)?),
            JobType::GenerateSummary => {
                JobPayload::GenerateSummary(serde_json::from_value(data).map_err(invalid)?)
            }
            JobType::SendEmail => JobPayload::SendEmail(serde_json::from_value(data).map_err(invalid)?),
        };

        payload.validate()?;
        Ok(payload)
    }

    /// The `data` half of the payload as untyped JSON (used by stores).
    pub fn data_json(&self) -> JsonValue {
        let value = match self {
            JobPayload::FetchDiff(d) => serde_json::to_value(d),
            JobPayload::GenerateSummary(d) => serde_json::to_value(d),
            JobPayload::SendEmail(d) => serde_json::to_value(d),
        };
        value.unwrap_or(JsonValue::Null)
    }

    /// Per-type schema check.
    pub fn validate(&self) -> DomainResult<()> {
        match self {
            JobPayload::FetchDiff(d) => {
                require_non_empty("owner", &d.owner)?;
                require_non_empty("repo", &d.repo)?;
                validate_sha(&d.sha)
            }
            JobPayload::GenerateSummary(d) => {
                validate_sha(&d.sha)?;
                require_non_empty("author", &d.author)?;
                require_non_empty("repository", &d.repository)
            }
            JobPayload::SendEmail(d) => {
                if d.recipients.is_empty() {
                    return Err(DomainError::validation("send_email requires at least one recipient"));
                }
                if let Some(bad) = d.recipients.iter().find(|r| !looks_like_email(r)) {
                    return Err(DomainError::validation(format!("invalid recipient: {bad}")));
                }
                if d.commit_ids.is_empty() {
                    return Err(DomainError::validation("send_email requires at least one commit"));
                }
                Ok(())
            }
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

fn validate_sha(sha: &str) -> DomainResult<()> {
    let len_ok = (7..=40).contains(&sha.len());
    if !len_ok || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DomainError::validation(format!("invalid commit sha: {sha:?}")));
    }
    Ok(())
}

fn looks_like_email(s: &str) -> bool {
    match s.trim().split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    }
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(flatten)]
    pub payload: JobPayload,
    pub status: JobStatus,
    /// Higher runs first among ready jobs
    pub priority: i32,
    /// Failed executions recorded so far
    pub attempts: u32,
    pub max_attempts: u32,
    /// Not eligible before this instant
    pub scheduled_for: DateTime<Utc>,
    pub project_id: Option<ProjectId>,
    pub commit_id: Option<CommitId>,
    pub error_message: Option<String>,
    pub error_details: Option<JsonValue>,
    pub result: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }

    /// Pending and due. Dependencies are checked by the store.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_for <= now
    }
}

/// Job creation request.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub payload: JobPayload,
    pub priority: Option<i32>,
    pub project_id: Option<ProjectId>,
    pub commit_id: Option<CommitId>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
    /// Jobs this one waits on; the edges are stored together with the job
    pub depends_on: Vec<JobId>,
}

impl NewJob {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            payload,
            priority: None,
            project_id: None,
            commit_id: None,
            scheduled_for: None,
            max_attempts: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn for_project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn for_commit(mut self, commit_id: CommitId) -> Self {
        self.commit_id = Some(commit_id);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn depends_on(mut self, job_id: JobId) -> Self {
        if !self.depends_on.contains(&job_id) {
            self.depends_on.push(job_id);
        }
        self
    }

    /// Validate the request and materialize a pending job.
    pub fn into_job(self, default_max_attempts: u32, now: DateTime<Utc>) -> DomainResult<Job> {
        self.payload.validate()?;

        let max_attempts = self.max_attempts.unwrap_or(default_max_attempts);
        if !(1..=MAX_ALLOWED_ATTEMPTS).contains(&max_attempts) {
            return Err(DomainError::validation(format!(
                "max_attempts must be between 1 and {MAX_ALLOWED_ATTEMPTS}"
            )));
        }

        Ok(Job {
            id: JobId::new(),
            payload: self.payload,
            status: JobStatus::Pending,
            priority: self.priority.unwrap_or(0),
            attempts: 0,
            max_attempts,
            scheduled_for: self.scheduled_for.unwrap_or(now),
            project_id: self.project_id,
            commit_id: self.commit_id,
            error_message: None,
            error_details: None,
            result: None,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Partial update restricted to the mutable fields of a job.
///
/// Nested options distinguish "leave unchanged" (`None`) from "clear"
/// (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub attempts: Option<u32>,
    pub error_message: Option<Option<String>>,
    pub error_details: Option<Option<JsonValue>>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub result: Option<Option<JsonValue>>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn error(mut self, message: impl Into<String>, details: Option<JsonValue>) -> Self {
        self.error_message = Some(Some(message.into()));
        self.error_details = Some(details);
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error_message = Some(None);
        self.error_details = Some(None);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn result(mut self, result: Option<JsonValue>) -> Self {
        self.result = Some(result);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply to a job in place and bump `updated_at`.
    pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
        if let Some(message) = &self.error_message {
            job.error_message = message.clone();
        }
        if let Some(details) = &self.error_details {
            job.error_details = details.clone();
        }
        if let Some(at) = self.scheduled_for {
            job.scheduled_for = at;
        }
        if let Some(result) = &self.result {
            job.result = result.clone();
        }
        job.updated_at = now;
    }
}

/// Filter for job listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub project_id: Option<ProjectId>,
    pub commit_id: Option<CommitId>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.job_type.is_none_or(|t| job.job_type() == t)
            && self.project_id.is_none_or(|p| job.project_id == Some(p))
            && self.commit_id.is_none_or(|c| job.commit_id == Some(c))
    }
}

/// Directed edge: `job_id` waits for `depends_on_job_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDependency {
    pub job_id: JobId,
    pub depends_on_job_id: JobId,
    pub created_at: DateTime<Utc>,
}

/// One `(status, type)` bucket of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatEntry {
    pub status: JobStatus,
    pub job_type: JobType,
    pub count: u64,
}

/// Job counts keyed by `(status, type)`; recomputed on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub entries: Vec<QueueStatEntry>,
    pub total: u64,
}

impl QueueStats {
    pub fn from_counts(counts: BTreeMap<(JobStatus, JobType), u64>) -> Self {
        let total = counts.values().sum();
        let entries = counts
            .into_iter()
            .map(|((status, job_type), count)| QueueStatEntry {
                status,
                job_type,
                count,
            })
            .collect();
        Self { entries, total }
    }

    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut counts = BTreeMap::new();
        for job in jobs {
            *counts.entry((job.status, job.job_type())).or_insert(0) += 1;
        }
        Self::from_counts(counts)
    }

    pub fn count(&self, status: JobStatus, job_type: JobType) -> u64 {
        self.entries
            .iter()
            .find(|e| e.status == status && e.job_type == job_type)
            .map_or(0, |e| e.count)
    }

    pub fn count_status(&self, status: JobStatus) -> u64 {
        self.entries.iter().filter(|e| e.status == status).map(|e| e.count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fetch_diff() -> JobPayload {
        JobPayload::FetchDiff(FetchDiffData {
            owner: "octo".into(),
            repo: "hello".into(),
            sha: "a1b2c3d4e5f6".into(),
            installation_id: None,
        })
    }

    #[test]
    fn new_job_applies_defaults() {
        let now = Utc::now();
        let job = NewJob::new(fetch_diff()).into_job(DEFAULT_MAX_ATTEMPTS, now).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 0);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.scheduled_for, now);
        assert_eq!(job.job_type(), JobType::FetchDiff);
    }

    #[test]
    fn max_attempts_out_of_range_is_rejected() {
        let err = NewJob::new(fetch_diff())
            .with_max_attempts(0)
            .into_job(DEFAULT_MAX_ATTEMPTS, Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn unknown_type_is_a_validation_error() {
        let err = JobPayload::from_parts("resize_image", json!({})).unwrap_err();
        match err {
            DomainError::Validation(msg) => assert!(msg.contains("resize_image")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn payload_schema_is_checked_per_type() {
        let ok = JobPayload::from_parts(
            "fetch_diff",
            json!({"owner": "octo", "repo": "hello", "sha": "deadbeef"}),
        );
        assert!(ok.is_ok());

        let missing_field = JobPayload::from_parts("fetch_diff", json!({"owner": "octo"}));
        assert!(matches!(missing_field, Err(DomainError::Validation(_))));

        let bad_sha = JobPayload::from_parts(
            "fetch_diff",
            json!({"owner": "octo", "repo": "hello", "sha": "not-a-sha"}),
        );
        assert!(matches!(bad_sha, Err(DomainError::Validation(_))));

        let no_recipients = JobPayload::from_parts(
            "send_email",
            json!({"recipients": [], "template": "digest", "commit_ids": [CommitId::new()]}),
        );
        assert!(matches!(no_recipients, Err(DomainError::Validation(_))));

        let bad_recipient = JobPayload::from_parts(
            "send_email",
            json!({"recipients": ["nobody"], "template": "digest", "commit_ids": [CommitId::new()]}),
        );
        assert!(matches!(bad_recipient, Err(DomainError::Validation(_))));
    }

    #[test]
    fn job_serializes_with_type_and_data() {
        let job = NewJob::new(fetch_diff()).into_job(3, Utc::now()).unwrap();
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["type"], "fetch_diff");
        assert_eq!(value["data"]["sha"], "a1b2c3d4e5f6");
        assert_eq!(value["status"], "pending");
    }

    #[test]
    fn update_distinguishes_clear_from_unchanged() {
        let now = Utc::now();
        let mut job = NewJob::new(fetch_diff()).into_job(3, now).unwrap();

        JobUpdate::new().error("boom", Some(json!({"code": 502}))).apply(&mut job, now);
        assert_eq!(job.error_message.as_deref(), Some("boom"));

        JobUpdate::new().attempts(1).apply(&mut job, now);
        assert_eq!(job.error_message.as_deref(), Some("boom"));

        JobUpdate::new().clear_error().apply(&mut job, now);
        assert!(job.error_message.is_none());
        assert!(job.error_details.is_none());
    }

    #[test]
    fn stats_count_by_status_and_type() {
        let now = Utc::now();
        let mut a = NewJob::new(fetch_diff()).into_job(3, now).unwrap();
        let b = NewJob::new(fetch_diff()).into_job(3, now).unwrap();
        a.status = JobStatus::Completed;

        let stats = QueueStats::from_jobs([&a, &b]);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.count(JobStatus::Completed, JobType::FetchDiff), 1);
        assert_eq!(stats.count(JobStatus::Pending, JobType::FetchDiff), 1);
        assert_eq!(stats.count(JobStatus::Pending, JobType::SendEmail), 0);
        assert_eq!(stats.count_status(JobStatus::Pending), 1);
    }
}
