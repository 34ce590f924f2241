//! Commit artifact storage used by the handlers and the digest scheduler.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use commitpulse_core::{CommitId, ProjectId};

/// A commit as tracked by the pipeline, with the artifacts produced so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: CommitId,
    pub project_id: ProjectId,
    pub sha: String,
    pub message: String,
    pub author: String,
    /// `owner/repo`
    pub repository: String,
    pub branch: Option<String>,
    pub diff: Option<String>,
    pub summary: Option<String>,
    pub emailed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CommitRecord {
    /// Summarized and not yet included in any email.
    pub fn is_digest_eligible(&self, since: Option<DateTime<Utc>>) -> bool {
        self.summary.is_some()
            && self.emailed_at.is_none()
            && since.is_none_or(|since| self.created_at >= since)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitStoreError {
    #[error("commit not found: {0}")]
    NotFound(CommitId),
    #[error("commit storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait CommitStore: Send + Sync {
    /// Store a new commit record. A record already stored under the same id
    /// is kept as is, artifacts included. Returns whether `record` was stored.
    async fn insert_if_absent(&self, record: CommitRecord) -> Result<bool, CommitStoreError>;

    async fn get(&self, id: CommitId) -> Result<Option<CommitRecord>, CommitStoreError>;

    async fn save_diff(&self, id: CommitId, diff: String) -> Result<(), CommitStoreError>;

    async fn save_summary(&self, id: CommitId, summary: String) -> Result<(), CommitStoreError>;

    /// Summarized, not-yet-emailed commits of a project, oldest first.
    async fn digest_eligible(
        &self,
        project_id: ProjectId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CommitRecord>, CommitStoreError>;

    async fn mark_emailed(&self, ids: &[CommitId], at: DateTime<Utc>) -> Result<(), CommitStoreError>;
}

/// In-memory commit store for tests and dev mode.
#[derive(Debug, Default)]
pub struct InMemoryCommitStore {
    commits: RwLock<HashMap<CommitId, CommitRecord>>,
}

impl InMemoryCommitStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_commit<T>(
        &self,
        id: CommitId,
        f: impl FnOnce(&mut CommitRecord) -> T,
    ) -> Result<T, CommitStoreError> {
        let mut commits = self
            .commits
            .write()
            .map_err(|_| CommitStoreError::Storage("commit store lock poisoned".to_string()))?;
        let record = commits.get_mut(&id).ok_or(CommitStoreError::NotFound(id))?;
        Ok(f(record))
    }
}

#[async_trait]
impl CommitStore for InMemoryCommitStore {
    async fn insert_if_absent(&self, record: CommitRecord) -> Result<bool, CommitStoreError> {
        let mut commits = self
            .commits
            .write()
            .map_err(|_| CommitStoreError::Storage("commit store lock poisoned".to_string()))?;
        if commits.contains_key(&record.id) {
            return Ok(false);
        }
        commits.insert(record.id, record);
        Ok(true)
    }

    async fn get(&self, id: CommitId) -> Result<Option<CommitRecord>, CommitStoreError> {
        let commits = self
            .commits
            .read()
            .map_err(|_| CommitStoreError::Storage("commit store lock poisoned".to_string()))?;
        Ok(commits.get(&id).cloned())
    }

    async fn save_diff(&self, id: CommitId, diff: String) -> Result<(), CommitStoreError> {
        self.with_commit(id, |c| c.diff = Some(diff))
    }

    async fn save_summary(&self, id: CommitId, summary: String) -> Result<(), CommitStoreError> {
        self.with_commit(id, |c| c.summary = Some(summary))
    }

    async fn digest_eligible(
        &self,
        project_id: ProjectId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CommitRecord>, CommitStoreError> {
        let commits = self
            .commits
            .read()
            .map_err(|_| CommitStoreError::Storage("commit store lock poisoned".to_string()))?;

        let mut eligible: Vec<_> = commits
            .values()
            .filter(|c| c.project_id == project_id && c.is_digest_eligible(since))
            .cloned()
            .collect();
        eligible.sort_by_key(|c| c.created_at);
        Ok(eligible)
    }

    async fn mark_emailed(&self, ids: &[CommitId], at: DateTime<Utc>) -> Result<(), CommitStoreError> {
        for id in ids {
            self.with_commit(*id, |c| c.emailed_at = Some(at))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn record(project_id: ProjectId) -> CommitRecord {
        CommitRecord {
            id: CommitId::new(),
            project_id,
            sha: "abc1234".into(),
            message: "Add retry budget".into(),
            author: "mona".into(),
            repository: "octo/hello".into(),
            branch: None,
            diff: None,
            summary: None,
            emailed_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn only_summarized_unsent_commits_are_eligible() {
        let store = InMemoryCommitStore::new();
        let project = ProjectId::new();

        let pending = record(project);
        let summarized = record(project);
        let other_project = record(ProjectId::new());
        for r in [&pending, &summarized, &other_project] {
            store.insert_if_absent(r.clone()).await.unwrap();
        }
        store.save_summary(summarized.id, "tidy".into()).await.unwrap();
        store.save_summary(other_project.id, "tidy".into()).await.unwrap();

        let eligible = store.digest_eligible(project, None).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, summarized.id);

        store.mark_emailed(&[summarized.id], Utc::now()).await.unwrap();
        assert!(store.digest_eligible(project, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn since_cutoff_excludes_older_commits() {
        let store = InMemoryCommitStore::new();
        let project = ProjectId::new();
        let mut old = record(project);
        old.created_at = Utc::now() - TimeDelta::days(3);
        old.summary = Some("old".into());
        store.insert_if_absent(old).await.unwrap();

        let since = Utc::now() - TimeDelta::days(1);
        assert!(store.digest_eligible(project, Some(since)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn artifacts_for_unknown_commit_are_not_found() {
        let store = InMemoryCommitStore::new();
        let id = CommitId::new();
        assert_eq!(
            store.save_diff(id, String::new()).await,
            Err(CommitStoreError::NotFound(id))
        );
    }

    #[tokio::test]
    async fn known_commit_keeps_its_artifacts() {
        let store = InMemoryCommitStore::new();
        let project = ProjectId::new();
        let original = record(project);
        assert!(store.insert_if_absent(original.clone()).await.unwrap());
        store.save_summary(original.id, "tidy".into()).await.unwrap();
        store.mark_emailed(&[original.id], Utc::now()).await.unwrap();

        let mut resubmitted = record(project);
        resubmitted.id = original.id;
        assert!(!store.insert_if_absent(resubmitted).await.unwrap());

        let stored = store.get(original.id).await.unwrap().unwrap();
        assert_eq!(stored.summary.as_deref(), Some("tidy"));
        assert!(stored.emailed_at.is_some());
        assert!(store.digest_eligible(project, None).await.unwrap().is_empty());
    }
}
