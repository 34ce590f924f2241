//! Job dependency graph.
//!
//! Edges point from a job to the job it waits for. The edge set is kept
//! acyclic: an insertion that would close a cycle is refused without
//! modifying the graph.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use chrono::{DateTime, Utc};

use super::types::{JobDependency, JobId, JobStatus};

/// Returned when an edge would close a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("dependency {job_id} -> {depends_on_id} would create a cycle")]
pub struct CycleDetected {
    pub job_id: JobId,
    pub depends_on_id: JobId,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// job -> (dependency -> edge creation time)
    edges: BTreeMap<JobId, BTreeMap<JobId, DateTime<Utc>>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `depends_on_id` can already reach `job_id` (or is the same job).
    pub fn would_create_cycle(&self, job_id: JobId, depends_on_id: JobId) -> bool {
        if job_id == depends_on_id {
            return true;
        }

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([depends_on_id]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            for next in self.dependency_ids(current) {
                if next == job_id {
                    return true;
                }
                queue.push_back(next);
            }
        }
        false
    }

    /// Insert an edge after the reachability check. Re-inserting an existing
    /// edge keeps its original timestamp.
    pub fn insert(
        &mut self,
        job_id: JobId,
        depends_on_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<JobDependency, CycleDetected> {
        if let Some(created_at) = self.edges.get(&job_id).and_then(|deps| deps.get(&depends_on_id)) {
            return Ok(JobDependency {
                job_id,
                depends_on_job_id: depends_on_id,
                created_at: *created_at,
            });
        }

        if self.would_create_cycle(job_id, depends_on_id) {
            return Err(CycleDetected {
                job_id,
                depends_on_id,
            });
        }

        self.edges.entry(job_id).or_default().insert(depends_on_id, now);
        Ok(JobDependency {
            job_id,
            depends_on_job_id: depends_on_id,
            created_at: now,
        })
    }

    pub fn remove(&mut self, job_id: JobId, depends_on_id: JobId) -> bool {
        let Some(deps) = self.edges.get_mut(&job_id) else {
            return false;
        };
        let removed = deps.remove(&depends_on_id).is_some();
        if deps.is_empty() {
            self.edges.remove(&job_id);
        }
        removed
    }

    /// Drop every edge touching `job_id`, in either direction.
    pub fn remove_job(&mut self, job_id: JobId) {
        self.edges.remove(&job_id);
        self.edges.retain(|_, deps| {
            deps.remove(&job_id);
            !deps.is_empty()
        });
    }

    pub fn dependencies(&self, job_id: JobId) -> Vec<JobDependency> {
        self.edges
            .get(&job_id)
            .map(|deps| {
                deps.iter()
                    .map(|(dep, created_at)| JobDependency {
                        job_id,
                        depends_on_job_id: *dep,
                        created_at: *created_at,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn dependency_ids(&self, job_id: JobId) -> impl Iterator<Item = JobId> + '_ {
        self.edges.get(&job_id).into_iter().flat_map(|deps| deps.keys().copied())
    }

    pub fn dependents(&self, job_id: JobId) -> BTreeSet<JobId> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.contains_key(&job_id))
            .map(|(job, _)| *job)
            .collect()
    }

    /// True when every dependency of `job_id` is completed. A job with no
    /// edges is satisfied. Unknown targets count as unsatisfied.
    pub fn is_satisfied<F>(&self, job_id: JobId, status_of: F) -> bool
    where
        F: Fn(JobId) -> Option<JobStatus>,
    {
        self.dependency_ids(job_id)
            .all(|dep| status_of(dep) == Some(JobStatus::Completed))
    }

    /// True when any dependency of `job_id` has failed terminally.
    pub fn is_blocked_by_failure<F>(&self, job_id: JobId, status_of: F) -> bool
    where
        F: Fn(JobId) -> Option<JobStatus>,
    {
        self.dependency_ids(job_id)
            .any(|dep| status_of(dep) == Some(JobStatus::Failed))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeMap::len).sum()
    }
}
