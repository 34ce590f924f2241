//! Postgres-backed job store.
//!
//! ## Schema
//!
//! `jobs` holds one row per job; `job_dependencies` holds the edges with
//! `ON DELETE CASCADE` on both ends, so deleting a job drops its edges.
//!
//! ## Concurrency
//!
//! - Claims and other guarded transitions are a single
//!   `UPDATE ... WHERE id = $1 AND status = $2 RETURNING ...`; Postgres row
//!   locking makes that a compare-and-set.
//! - Edge insertion takes a `SHARE ROW EXCLUSIVE` lock on `job_dependencies`
//!   for the duration of its transaction, so the recursive reachability
//!   check and the insert cannot interleave with another writer.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert) / `Storage` |
//! | Database (foreign key violation) | `23503` | `Storage` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use commitpulse_core::{CommitId, ProjectId};

use super::store::{JobStore, StoreError};
use super::types::{
    Job, JobDependency, JobFilter, JobId, JobPayload, JobStatus, JobUpdate, QueueStats,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id              UUID PRIMARY KEY,
    job_type        TEXT NOT NULL,
    data            JSONB NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending',
    priority        INTEGER NOT NULL DEFAULT 0,
    attempts        INTEGER NOT NULL DEFAULT 0,
    max_attempts    INTEGER NOT NULL DEFAULT 3,
    scheduled_for   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    project_id      UUID,
    commit_id       UUID,
    error_message   TEXT,
    error_details   JSONB,
    result          JSONB,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT jobs_status_check CHECK (status IN ('pending', 'running', 'completed', 'failed'))
);

CREATE INDEX IF NOT EXISTS jobs_ready_idx ON jobs (status, scheduled_for, priority DESC, created_at);
CREATE INDEX IF NOT EXISTS jobs_project_idx ON jobs (project_id);
CREATE INDEX IF NOT EXISTS jobs_commit_idx ON jobs (commit_id);

CREATE TABLE IF NOT EXISTS job_dependencies (
    job_id              UUID NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
    depends_on_job_id   UUID NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (job_id, depends_on_job_id)
);

CREATE INDEX IF NOT EXISTS job_dependencies_target_idx ON job_dependencies (depends_on_job_id);
"#;

const JOB_COLUMNS: &str = "id, job_type, data, status, priority, attempts, max_attempts, \
     scheduled_for, project_id, commit_id, error_message, error_details, result, \
     created_at, updated_at";

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn apply_update(
        &self,
        id: JobId,
        expected: Option<JobStatus>,
        update: &JobUpdate,
    ) -> Result<Option<Job>, StoreError> {
        // COALESCE leaves unset fields untouched; the *_set flags let callers
        // clear nullable columns explicitly.
        let sql = format!(
            r#"
            UPDATE jobs SET
                status = COALESCE($3, status),
                attempts = COALESCE($4, attempts),
                error_message = CASE WHEN $5 THEN $6 ELSE error_message END,
                error_details = CASE WHEN $7 THEN $8 ELSE error_details END,
                scheduled_for = COALESCE($9, scheduled_for),
                result = CASE WHEN $10 THEN $11 ELSE result END,
                updated_at = NOW()
            WHERE id = $1 AND ($2::text IS NULL OR status = $2)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(expected.map(|s| s.as_str()))
            .bind(update.status.map(|s| s.as_str()))
            .bind(update.attempts.map(|a| a as i32))
            .bind(update.error_message.is_some())
            .bind(update.error_message.clone().flatten())
            .bind(update.error_details.is_some())
            .bind(update.error_details.clone().flatten())
            .bind(update.scheduled_for)
            .bind(update.result.is_some())
            .bind(update.result.clone().flatten())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_job", e))?;

        match row {
            Some(row) => Ok(Some(job_from_row(&row)?)),
            None if self.get(id).await?.is_none() => Err(StoreError::NotFound(id)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip(self, job, depends_on),
        fields(job_id = %job.id, job_type = %job.job_type(), dependencies = depends_on.len()),
        err
    )]
    async fn insert_with_dependencies(
        &self,
        job: Job,
        depends_on: &[JobId],
    ) -> Result<Job, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, data, status, priority, attempts, max_attempts,
                scheduled_for, project_id, commit_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.job_type().as_str())
        .bind(job.payload.data_json())
        .bind(job.status.as_str())
        .bind(job.priority)
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(job.scheduled_for)
        .bind(job.project_id.map(uuid::Uuid::from))
        .bind(job.commit_id.map(uuid::Uuid::from))
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        // The new row has no incoming edges yet, so only a self-edge can close a cycle.
        for depends_on_id in depends_on {
            if *depends_on_id == job.id {
                tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(StoreError::Cycle {
                    job_id: job.id,
                    depends_on_id: job.id,
                });
            }
            if !job_exists(&mut tx, *depends_on_id).await? {
                tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(StoreError::NotFound(*depends_on_id));
            }

            sqlx::query(
                r#"
                INSERT INTO job_dependencies (job_id, depends_on_job_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(job.id.as_uuid())
            .bind(depends_on_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_dependency", e))?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::text IS NULL OR status = $1)
                AND ($2::text IS NULL OR job_type = $2)
                AND ($3::uuid IS NULL OR project_id = $3)
                AND ($4::uuid IS NULL OR commit_id = $4)
            ORDER BY created_at DESC, id DESC
            LIMIT $5
            "#
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.job_type.map(|t| t.as_str()))
        .bind(filter.project_id.map(uuid::Uuid::from))
        .bind(filter.commit_id.map(uuid::Uuid::from))
        .bind(filter.limit.map(|l| l as i64))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, update), err)]
    async fn update(&self, id: JobId, update: &JobUpdate) -> Result<Job, StoreError> {
        self.apply_update(id, None, update)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    #[instrument(skip(self, update), err)]
    async fn update_if_status(
        &self,
        id: JobId,
        expected: JobStatus,
        update: &JobUpdate,
    ) -> Result<Option<Job>, StoreError> {
        self.apply_update(id, Some(expected), update).await
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs j
            WHERE j.status = 'pending'
                AND j.scheduled_for <= $1
                AND NOT EXISTS (
                    SELECT 1
                    FROM job_dependencies d
                    JOIN jobs dep ON dep.id = d.depends_on_job_id
                    WHERE d.job_id = j.id AND dep.status <> 'completed'
                )
            ORDER BY j.priority DESC, j.created_at ASC, j.id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ready_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn insert_dependency(
        &self,
        job_id: JobId,
        depends_on_id: JobId,
    ) -> Result<JobDependency, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("LOCK TABLE job_dependencies IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_dependencies", e))?;

        for id in [job_id, depends_on_id] {
            if !job_exists(&mut tx, id).await? {
                tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(StoreError::NotFound(id));
            }
        }

        if let Some(existing) = existing_edge(&mut tx, job_id, depends_on_id).await? {
            tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;
            return Ok(existing);
        }

        if job_id == depends_on_id || reaches(&mut tx, depends_on_id, job_id).await? {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::Cycle {
                job_id,
                depends_on_id,
            });
        }

        let row = sqlx::query(
            r#"
            INSERT INTO job_dependencies (job_id, depends_on_job_id)
            VALUES ($1, $2)
            RETURNING created_at
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(depends_on_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_dependency", e))?;

        let created_at: DateTime<Utc> = row
            .try_get("created_at")
            .map_err(|e| StoreError::Storage(format!("failed to read created_at: {e}")))?;

        tx.commit().await.map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(JobDependency {
            job_id,
            depends_on_job_id: depends_on_id,
            created_at,
        })
    }

    #[instrument(skip(self), err)]
    async fn remove_dependency(&self, job_id: JobId, depends_on_id: JobId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM job_dependencies WHERE job_id = $1 AND depends_on_job_id = $2")
            .bind(job_id.as_uuid())
            .bind(depends_on_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove_dependency", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn dependencies(&self, job_id: JobId) -> Result<Vec<JobDependency>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, depends_on_job_id, created_at
            FROM job_dependencies
            WHERE job_id = $1
            ORDER BY depends_on_job_id
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dependencies", e))?;

        rows.iter().map(dependency_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query(
            "SELECT status, job_type, COUNT(*) AS count FROM jobs GROUP BY status, job_type",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut counts = std::collections::BTreeMap::new();
        for row in rows {
            let status: String = row.try_get("status").map_err(read_err)?;
            let job_type: String = row.try_get("job_type").map_err(read_err)?;
            let count: i64 = row.try_get("count").map_err(read_err)?;

            let status = status.parse().map_err(|e| StoreError::Storage(format!("{e}")))?;
            let job_type = job_type.parse().map_err(|e| StoreError::Storage(format!("{e}")))?;
            counts.insert((status, job_type), count as u64);
        }

        Ok(QueueStats::from_counts(counts))
    }

    #[instrument(skip(self), err)]
    async fn running_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'running' AND updated_at < $1
            ORDER BY updated_at ASC
            "#
        ))
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("running_before", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE status = 'completed' AND updated_at < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_completed", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn delete_expired_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs j
            WHERE j.updated_at < $1
                AND (
                    j.status = 'failed'
                    OR (
                        j.status = 'pending'
                        AND EXISTS (
                            SELECT 1
                            FROM job_dependencies d
                            JOIN jobs dep ON dep.id = d.depends_on_job_id
                            WHERE d.job_id = j.id AND dep.status = 'failed'
                        )
                    )
                )
            "#,
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_expired", e))?;
        Ok(result.rows_affected())
    }
}

async fn job_exists(tx: &mut Transaction<'_, Postgres>, id: JobId) -> Result<bool, StoreError> {
    let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM jobs WHERE id = $1) AS present")
        .bind(id.as_uuid())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("job_exists", e))?;
    row.try_get("present").map_err(read_err)
}

async fn existing_edge(
    tx: &mut Transaction<'_, Postgres>,
    job_id: JobId,
    depends_on_id: JobId,
) -> Result<Option<JobDependency>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT job_id, depends_on_job_id, created_at
        FROM job_dependencies
        WHERE job_id = $1 AND depends_on_job_id = $2
        "#,
    )
    .bind(job_id.as_uuid())
    .bind(depends_on_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("existing_edge", e))?;

    row.map(|r| dependency_from_row(&r)).transpose()
}

/// Whether `target` is reachable from `from` by following dependency edges.
async fn reaches(
    tx: &mut Transaction<'_, Postgres>,
    from: JobId,
    target: JobId,
) -> Result<bool, StoreError> {
    let row = sqlx::query(
        r#"
        WITH RECURSIVE reachable(id) AS (
            SELECT depends_on_job_id FROM job_dependencies WHERE job_id = $1
            UNION
            SELECT d.depends_on_job_id
            FROM job_dependencies d
            JOIN reachable r ON d.job_id = r.id
        )
        SELECT EXISTS (SELECT 1 FROM reachable WHERE id = $2) AS found
        "#,
    )
    .bind(from.as_uuid())
    .bind(target.as_uuid())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("reachability", e))?;

    row.try_get("found").map_err(read_err)
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    let job_type: String = row.try_get("job_type").map_err(read_err)?;
    let data: serde_json::Value = row.try_get("data").map_err(read_err)?;
    let status: String = row.try_get("status").map_err(read_err)?;
    let priority: i32 = row.try_get("priority").map_err(read_err)?;
    let attempts: i32 = row.try_get("attempts").map_err(read_err)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(read_err)?;
    let project_id: Option<uuid::Uuid> = row.try_get("project_id").map_err(read_err)?;
    let commit_id: Option<uuid::Uuid> = row.try_get("commit_id").map_err(read_err)?;
    let id: uuid::Uuid = row.try_get("id").map_err(read_err)?;

    let payload = JobPayload::from_parts(&job_type, data)
        .map_err(|e| StoreError::Storage(format!("job {id} has invalid payload: {e}")))?;
    let status = status
        .parse()
        .map_err(|e| StoreError::Storage(format!("job {id}: {e}")))?;

    Ok(Job {
        id: JobId::from_uuid(id),
        payload,
        status,
        priority,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        scheduled_for: row.try_get("scheduled_for").map_err(read_err)?,
        project_id: project_id.map(ProjectId::from_uuid),
        commit_id: commit_id.map(CommitId::from_uuid),
        error_message: row.try_get("error_message").map_err(read_err)?,
        error_details: row.try_get("error_details").map_err(read_err)?,
        result: row.try_get("result").map_err(read_err)?,
        created_at: row.try_get("created_at").map_err(read_err)?,
        updated_at: row.try_get("updated_at").map_err(read_err)?,
    })
}

fn dependency_from_row(row: &sqlx::postgres::PgRow) -> Result<JobDependency, StoreError> {
    let job_id: uuid::Uuid = row.try_get("job_id").map_err(read_err)?;
    let depends_on: uuid::Uuid = row.try_get("depends_on_job_id").map_err(read_err)?;
    Ok(JobDependency {
        job_id: JobId::from_uuid(job_id),
        depends_on_job_id: JobId::from_uuid(depends_on),
        created_at: row.try_get("created_at").map_err(read_err)?,
    })
}

fn read_err(e: sqlx::Error) -> StoreError {
    StoreError::Storage(format!("failed to read row: {e}"))
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            StoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => StoreError::Storage(format!("connection pool closed in {operation}")),
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
