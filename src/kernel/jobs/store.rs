//! Job Record Store (component G).
//!
//! Exposes the minimal transactional surface the HTTP handlers and the
//! workers need: insert, read, field updates, filtered listing, and an
//! active-job count used by the concurrency gate (§4.B).

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::job::{Job, JobStatus};

/// Optional filter for `list`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub user_id: Option<String>,
    pub status: Option<JobStatus>,
}

/// Field-level patch applied atomically by `update`.
///
/// Only the fields relevant to a given transition are set; callers build
/// one of these per state transition rather than re-fetching and mutating
/// a whole `Job`, keeping the store the single place that enforces the
/// timestamp invariants from §3.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub assigned_node_id: Option<Option<i32>>,
    pub remote_pid: Option<Option<i32>>,
    pub stdout_blob: Option<Option<String>>,
    pub stderr_blob: Option<Option<String>>,
    pub exit_code: Option<Option<i32>>,
    pub started_at: Option<Option<chrono::DateTime<Utc>>>,
    pub completed_at: Option<Option<chrono::DateTime<Utc>>>,
}

impl JobUpdate {
    /// Transition pending -> running, writing assigned_node_id and started_at
    /// together as the invariants in §3 require.
    pub fn start(node_id: i32) -> Self {
        Self {
            status: Some(JobStatus::Running),
            assigned_node_id: Some(Some(node_id)),
            started_at: Some(Some(Utc::now())),
            ..Default::default()
        }
    }

    pub fn set_remote_pid(pid: i32) -> Self {
        Self {
            remote_pid: Some(Some(pid)),
            ..Default::default()
        }
    }

    /// Transition to a terminal state, writing completed_at in the same
    /// update (§3 invariant: terminal ⇒ completed_at != null).
    pub fn terminal(
        status: JobStatus,
        stdout: Option<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        debug_assert!(status.is_terminal());
        Self {
            status: Some(status),
            stdout_blob: Some(stdout),
            stderr_blob: Some(stderr),
            exit_code: Some(exit_code),
            completed_at: Some(Some(Utc::now())),
            ..Default::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: Some(JobStatus::Cancelled),
            completed_at: Some(Some(Utc::now())),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: Job) -> Result<Job>;
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;
    async fn update(&self, job_id: Uuid, patch: JobUpdate) -> Result<Option<Job>>;
    async fn list(&self, filter: JobFilter, limit: i64) -> Result<Vec<Job>>;
    async fn count_active_for(&self, user_id: &str) -> Result<i64>;
    /// Last `limit` terminal jobs ordered by completion time, used by the
    /// dashboard's success-rate metric.
    async fn recent_terminal(&self, limit: i64) -> Result<Vec<Job>>;
}

/// PostgreSQL-backed job store.
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: Job) -> Result<Job> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, owner_user_id, competition_id, project_id, expected_time_seconds,
                token_fingerprint, status, assigned_node_id, remote_pid,
                stdout_blob, stderr_blob, exit_code,
                created_at, started_at, completed_at, code_path, config_path
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
            "#,
        )
        .bind(job.id)
        .bind(&job.owner_user_id)
        .bind(&job.competition_id)
        .bind(&job.project_id)
        .bind(job.expected_time_seconds)
        .bind(&job.token_fingerprint)
        .bind(job.status)
        .bind(job.assigned_node_id)
        .bind(job.remote_pid)
        .bind(&job.stdout_blob)
        .bind(&job.stderr_blob)
        .bind(job.exit_code)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.code_path)
        .bind(&job.config_path)
        .execute(&self.pool)
        .await?;
        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn update(&self, job_id: Uuid, patch: JobUpdate) -> Result<Option<Job>> {
        // Built as a fixed statement covering every patchable column; unset
        // fields fall back to their current value via COALESCE-free direct
        // binds guarded by the Option<Option<_>> "is this field touched" shape.
        let mut job = match self.get(job_id).await? {
            Some(j) => j,
            None => return Ok(None),
        };

        if let Some(status) = patch.status {
            job.status = status;
        }
        if let Some(v) = patch.assigned_node_id {
            job.assigned_node_id = v;
        }
        if let Some(v) = patch.remote_pid {
            job.remote_pid = v;
        }
        if let Some(v) = patch.stdout_blob {
            job.stdout_blob = v;
        }
        if let Some(v) = patch.stderr_blob {
            job.stderr_blob = v;
        }
        if let Some(v) = patch.exit_code {
            job.exit_code = v;
        }
        if let Some(v) = patch.started_at {
            job.started_at = v;
        }
        if let Some(v) = patch.completed_at {
            job.completed_at = v;
        }

        sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2, assigned_node_id = $3, remote_pid = $4,
                stdout_blob = $5, stderr_blob = $6, exit_code = $7,
                started_at = $8, completed_at = $9
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(job.status)
        .bind(job.assigned_node_id)
        .bind(job.remote_pid)
        .bind(&job.stdout_blob)
        .bind(&job.stderr_blob)
        .bind(job.exit_code)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(Some(job))
    }

    async fn list(&self, filter: JobFilter, limit: i64) -> Result<Vec<Job>> {
        // Dynamic predicate built server-side; parameter count stays small
        // and fixed per branch to keep this readable without a query builder.
        let jobs = match (filter.user_id, filter.status) {
            (Some(uid), Some(status)) => {
                sqlx::query_as::<_, Job>(
                    "SELECT * FROM jobs WHERE owner_user_id = $1 AND status = $2 ORDER BY created_at DESC LIMIT $3",
                )
                .bind(uid)
                .bind(status)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(uid), None) => {
                sqlx::query_as::<_, Job>(
                    "SELECT * FROM jobs WHERE owner_user_id = $1 ORDER BY created_at DESC LIMIT $2",
                )
                .bind(uid)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, Some(status)) => {
                sqlx::query_as::<_, Job>(
                    "SELECT * FROM jobs WHERE status = $1 ORDER BY created_at DESC LIMIT $2",
                )
                .bind(status)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, None) => {
                sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY created_at DESC LIMIT $1")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(jobs)
    }

    async fn count_active_for(&self, user_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs WHERE owner_user_id = $1 AND status IN ('pending', 'running')",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn recent_terminal(&self, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE status IN ('completed', 'failed', 'cancelled') ORDER BY completed_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }
}

/// In-memory job store used by unit and integration tests so the HTTP
/// surface and worker logic can be exercised without a database.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<Job> {
        self.jobs.lock().expect("poisoned").insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.lock().expect("poisoned").get(&job_id).cloned())
    }

    async fn update(&self, job_id: Uuid, patch: JobUpdate) -> Result<Option<Job>> {
        let mut jobs = self.jobs.lock().expect("poisoned");
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if let Some(status) = patch.status {
            job.status = status;
        }
        if let Some(v) = patch.assigned_node_id {
            job.assigned_node_id = v;
        }
        if let Some(v) = patch.remote_pid {
            job.remote_pid = v;
        }
        if let Some(v) = patch.stdout_blob {
            job.stdout_blob = v;
        }
        if let Some(v) = patch.stderr_blob {
            job.stderr_blob = v;
        }
        if let Some(v) = patch.exit_code {
            job.exit_code = v;
        }
        if let Some(v) = patch.started_at {
            job.started_at = v;
        }
        if let Some(v) = patch.completed_at {
            job.completed_at = v;
        }
        Ok(Some(job.clone()))
    }

    async fn list(&self, filter: JobFilter, limit: i64) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().expect("poisoned");
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| {
                filter.user_id.as_deref().map_or(true, |u| j.owner_user_id == u)
                    && filter.status.map_or(true, |s| j.status == s)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn count_active_for(&self, user_id: &str) -> Result<i64> {
        let jobs = self.jobs.lock().expect("poisoned");
        Ok(jobs
            .values()
            .filter(|j| j.owner_user_id == user_id && j.status.is_active())
            .count() as i64)
    }

    async fn recent_terminal(&self, limit: i64) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().expect("poisoned");
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|j| j.status.is_terminal())
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job(user: &str) -> Job {
        Job::builder()
            .owner_user_id(user)
            .competition_id("comp")
            .project_id("proj")
            .expected_time_seconds(10)
            .token_fingerprint("fp")
            .code_path("p")
            .config_path("c")
            .build()
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = InMemoryJobStore::new();
        let job = sample_job("alice");
        let id = job.id;
        store.insert(job).await.unwrap();
        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.owner_user_id, "alice");
    }

    #[tokio::test]
    async fn count_active_only_counts_pending_and_running() {
        let store = InMemoryJobStore::new();
        let mut job = sample_job("alice");
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.exit_code = Some(0);
        store.insert(job).await.unwrap();
        assert_eq!(store.count_active_for("alice").await.unwrap(), 0);

        store.insert(sample_job("alice")).await.unwrap();
        assert_eq!(store.count_active_for("alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_applies_only_touched_fields() {
        let store = InMemoryJobStore::new();
        let job = sample_job("alice");
        let id = job.id;
        store.insert(job).await.unwrap();

        store.update(id, JobUpdate::start(3)).await.unwrap();
        let running = store.get(id).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.assigned_node_id, Some(3));
        assert!(running.started_at.is_some());

        store
            .update(
                id,
                JobUpdate::terminal(JobStatus::Completed, Some("out".into()), Some(String::new()), Some(0)),
            )
            .await
            .unwrap();
        let done = store.get(id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.exit_code, Some(0));
        assert!(done.completed_at.is_some());
        // fields not touched by the terminal patch survive
        assert_eq!(done.assigned_node_id, Some(3));
    }

    #[tokio::test]
    async fn list_filters_by_user_and_status() {
        let store = InMemoryJobStore::new();
        store.insert(sample_job("alice")).await.unwrap();
        store.insert(sample_job("bob")).await.unwrap();

        let alice_jobs = store
            .list(
                JobFilter {
                    user_id: Some("alice".into()),
                    status: None,
                },
                50,
            )
            .await
            .unwrap();
        assert_eq!(alice_jobs.len(), 1);
        assert_eq!(alice_jobs[0].owner_user_id, "alice");
    }
}
