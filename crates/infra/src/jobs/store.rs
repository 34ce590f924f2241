//! Job storage abstraction and the in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::graph::DependencyGraph;
use super::types::{Job, JobDependency, JobFilter, JobId, JobStatus, JobUpdate, QueueStats};

/// Job store abstraction.
///
/// Implementations must make `update_if_status` an atomic compare-and-set and
/// must serialize edge insertion so the acyclicity check and the write happen
/// as one step.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job with no dependencies.
    async fn insert(&self, job: Job) -> Result<Job, StoreError> {
        self.insert_with_dependencies(job, &[]).await
    }

    /// Persist a new job together with its dependency edges in one step, so
    /// the job is never visible without them. Fails with `NotFound` if a
    /// dependency target is absent, leaving nothing stored.
    async fn insert_with_dependencies(
        &self,
        job: Job,
        depends_on: &[JobId],
    ) -> Result<Job, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Jobs matching the filter, newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Unconditional partial update. Fails with `NotFound` if absent.
    async fn update(&self, id: JobId, update: &JobUpdate) -> Result<Job, StoreError>;

    /// Apply `update` only if the job currently has status `expected`.
    /// `Ok(None)` means the job exists but was in another status.
    async fn update_if_status(
        &self,
        id: JobId,
        expected: JobStatus,
        update: &JobUpdate,
    ) -> Result<Option<Job>, StoreError>;

    /// Remove a job and every edge touching it. Returns whether it existed.
    async fn delete(&self, id: JobId) -> Result<bool, StoreError>;

    /// Pending jobs due at `now` whose dependencies are all completed,
    /// ordered by priority (desc) then creation time (asc).
    async fn ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError>;

    async fn insert_dependency(
        &self,
        job_id: JobId,
        depends_on_id: JobId,
    ) -> Result<JobDependency, StoreError>;

    async fn remove_dependency(&self, job_id: JobId, depends_on_id: JobId) -> Result<bool, StoreError>;

    async fn dependencies(&self, job_id: JobId) -> Result<Vec<JobDependency>, StoreError>;

    async fn stats(&self) -> Result<QueueStats, StoreError>;

    /// Running jobs whose `updated_at` is older than `cutoff`.
    async fn running_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Delete completed jobs last updated before `cutoff`.
    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete failed jobs, and pending jobs stuck behind a failed dependency,
    /// last updated before `cutoff`.
    async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("dependency {job_id} -> {depends_on_id} would create a cycle")]
    Cycle { job_id: JobId, depends_on_id: JobId },
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    graph: DependencyGraph,
}

impl Inner {
    fn status_of(&self, id: JobId) -> Option<JobStatus> {
        self.jobs.get(&id).map(|j| j.status)
    }

    fn remove_job(&mut self, id: JobId) -> bool {
        self.graph.remove_job(id);
        self.jobs.remove(&id).is_some()
    }
}

/// In-memory job store for tests and dev mode.
///
/// A single lock covers jobs and edges, which makes the status CAS and
/// checked edge insertion atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Storage("job store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_with_dependencies(
        &self,
        job: Job,
        depends_on: &[JobId],
    ) -> Result<Job, StoreError> {
        let mut inner = self.write()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        if depends_on.contains(&job.id) {
            return Err(StoreError::Cycle {
                job_id: job.id,
                depends_on_id: job.id,
            });
        }
        if let Some(missing) = depends_on.iter().find(|id| !inner.jobs.contains_key(*id)) {
            return Err(StoreError::NotFound(*missing));
        }

        let now = Utc::now();
        for depends_on_id in depends_on {
            if let Err(c) = inner.graph.insert(job.id, *depends_on_id, now) {
                inner.graph.remove_job(job.id);
                return Err(StoreError::Cycle {
                    job_id: c.job_id,
                    depends_on_id: c.depends_on_id,
                });
            }
        }

        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner.jobs.values().filter(|j| filter.matches(j)).cloned().collect();

        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn update(&self, id: JobId, update: &JobUpdate) -> Result<Job, StoreError> {
        let mut inner = self.write()?;
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        update.apply(job, Utc::now());
        Ok(job.clone())
    }

    async fn update_if_status(
        &self,
        id: JobId,
        expected: JobStatus,
        update: &JobUpdate,
    ) -> Result<Option<Job>, StoreError> {
        let mut inner = self.write()?;
        let job = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status != expected {
            return Ok(None);
        }
        update.apply(job, Utc::now());
        Ok(Some(job.clone()))
    }

    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        Ok(self.write()?.remove_job(id))
    }

    async fn ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let inner = self.read()?;
        let mut candidates: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.is_due(now) && inner.graph.is_satisfied(j.id, |dep| inner.status_of(dep)))
            .collect();

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        Ok(candidates.into_iter().take(limit).cloned().collect())
    }

    async fn insert_dependency(
        &self,
        job_id: JobId,
        depends_on_id: JobId,
    ) -> Result<JobDependency, StoreError> {
        let mut inner = self.write()?;
        for id in [job_id, depends_on_id] {
            if !inner.jobs.contains_key(&id) {
                return Err(StoreError::NotFound(id));
            }
        }

        inner
            .graph
            .insert(job_id, depends_on_id, Utc::now())
            .map_err(|c| StoreError::Cycle {
                job_id: c.job_id,
                depends_on_id: c.depends_on_id,
            })
    }

    async fn remove_dependency(&self, job_id: JobId, depends_on_id: JobId) -> Result<bool, StoreError> {
        Ok(self.write()?.graph.remove(job_id, depends_on_id))
    }

    async fn dependencies(&self, job_id: JobId) -> Result<Vec<JobDependency>, StoreError> {
        Ok(self.read()?.graph.dependencies(job_id))
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        Ok(QueueStats::from_jobs(self.read()?.jobs.values()))
    }

    async fn running_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let inner = self.read()?;
        let mut stale: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && j.updated_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.updated_at);
        Ok(stale)
    }

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.write()?;
        let doomed: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Completed && j.updated_at < cutoff)
            .map(|j| j.id)
            .collect();

        Ok(doomed.into_iter().filter(|id| inner.remove_job(*id)).count() as u64)
    }

    async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.write()?;
        let statuses: BTreeMap<JobId, JobStatus> =
            inner.jobs.values().map(|j| (j.id, j.status)).collect();

        let doomed: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| j.updated_at < cutoff)
            .filter(|j| match j.status {
                JobStatus::Failed => true,
                JobStatus::Pending => inner
                    .graph
                    .is_blocked_by_failure(j.id, |dep| statuses.get(&dep).copied()),
                _ => false,
            })
            .map(|j| j.id)
            .collect();

        Ok(doomed.into_iter().filter(|id| inner.remove_job(*id)).count() as u64)
    }
}
