use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use commitpulse_core::{CommitId, DomainResult, JobId, ProjectId};
use commitpulse_infra::jobs::{JobFilter, JobPayload, JobStatus, JobType, JobUpdate, NewJob};

pub const DEFAULT_READY_LIMIT: usize = 10;
pub const MAX_READY_LIMIT: usize = 100;

// Request DTOs

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub data: JsonValue,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub commit_id: Option<CommitId>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Jobs to wait on, stored atomically with the new job
    #[serde(default)]
    pub depends_on: Vec<JobId>,
}

impl CreateJobRequest {
    pub fn into_new_job(self) -> DomainResult<NewJob> {
        let mut job = NewJob::new(JobPayload::from_parts(&self.job_type, self.data)?);
        if let Some(priority) = self.priority {
            job = job.with_priority(priority);
        }
        if let Some(project_id) = self.project_id {
            job = job.for_project(project_id);
        }
        if let Some(commit_id) = self.commit_id {
            job = job.for_commit(commit_id);
        }
        if let Some(at) = self.scheduled_for {
            job = job.scheduled_for(at);
        }
        if let Some(max_attempts) = self.max_attempts {
            job = job.with_max_attempts(max_attempts);
        }
        for id in self.depends_on {
            job = job.depends_on(id);
        }
        Ok(job)
    }
}

/// Partial update. `clear_error` wins over a supplied `error_message`.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateJobRequest {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_details: Option<JsonValue>,
    #[serde(default)]
    pub clear_error: bool,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<JsonValue>,
}

impl UpdateJobRequest {
    pub fn into_update(self) -> JobUpdate {
        let mut update = JobUpdate::new();
        if let Some(status) = self.status {
            update = update.status(status);
        }
        if let Some(attempts) = self.attempts {
            update = update.attempts(attempts);
        }
        if self.clear_error {
            update = update.clear_error();
        } else if let Some(message) = self.error_message {
            update = update.error(message, self.error_details);
        }
        if let Some(at) = self.scheduled_for {
            update = update.scheduled_for(at);
        }
        if let Some(result) = self.result {
            update = update.result(Some(result));
        }
        update
    }
}

#[derive(Debug, Deserialize)]
pub struct FailJobRequest {
    pub message: String,
    #[serde(default)]
    pub details: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
pub struct AddDependencyRequest {
    pub depends_on_id: JobId,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub project_id: Option<String>,
    pub commit_id: Option<String>,
    pub limit: Option<usize>,
}

impl ListJobsQuery {
    pub fn into_filter(self) -> DomainResult<JobFilter> {
        Ok(JobFilter {
            status: self.status.map(|s| s.parse::<JobStatus>()).transpose()?,
            job_type: self.job_type.map(|t| t.parse::<JobType>()).transpose()?,
            project_id: self.project_id.map(|p| p.parse::<ProjectId>()).transpose()?,
            commit_id: self.commit_id.map(|c| c.parse::<CommitId>()).transpose()?,
            limit: self.limit,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ReadyQuery {
    pub limit: Option<usize>,
}

impl ReadyQuery {
    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_READY_LIMIT)
            .clamp(1, MAX_READY_LIMIT)
    }
}

/// Retention overrides in hours; config defaults apply when absent.
#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub completed_older_than_hours: Option<u64>,
    #[serde(default)]
    pub failed_older_than_hours: Option<u64>,
}
