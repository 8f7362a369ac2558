//! `GET /dashboard` (§4.H): aggregate counts, per-node queue state,
//! recent activity, and health metrics. Admins see everything; non-admins
//! see only their own slice.

use std::collections::HashMap;

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::common::DispatchError;
use crate::kernel::jobs::{JobFilter, JobStatus, NodeStats};
use crate::server::middleware::AuthUser;
use crate::server::state::AppState;

#[derive(Debug, Default, Serialize)]
pub struct JobCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobCounts {
    fn tally<'a>(jobs: impl Iterator<Item = &'a JobStatus>) -> Self {
        let mut counts = JobCounts::default();
        for status in jobs {
            counts.total += 1;
            match status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Running => counts.running += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Serialize)]
pub struct RecentJob {
    pub job_id: Uuid,
    pub user_id: String,
    pub competition_id: String,
    pub status: JobStatus,
    pub node_id: Option<i32>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_seconds: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HealthMetrics {
    pub utilization: f64,
    pub success_rate: f64,
    pub jobs_last_24h: usize,
}

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub job_stats: JobCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_stats: Option<HashMap<String, JobCounts>>,
    pub node_stats: Vec<NodeStats>,
    pub recent_jobs: Vec<RecentJob>,
    pub health: HealthMetrics,
}

pub async fn dashboard(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<DashboardResponse>, DispatchError> {
    let scope_user = if auth.is_admin { None } else { Some(auth.user_id.clone()) };

    let all_jobs = state
        .jobs
        .list(
            JobFilter {
                user_id: scope_user.clone(),
                status: None,
            },
            i64::MAX,
        )
        .await
        .map_err(DispatchError::Internal)?;

    let job_stats = JobCounts::tally(all_jobs.iter().map(|j| &j.status));

    let user_stats = if auth.is_admin {
        let mut by_user: HashMap<String, Vec<&JobStatus>> = HashMap::new();
        for job in &all_jobs {
            by_user.entry(job.owner_user_id.clone()).or_default().push(&job.status);
        }
        Some(
            by_user
                .into_iter()
                .map(|(user, statuses)| (user, JobCounts::tally(statuses.into_iter())))
                .collect(),
        )
    } else {
        None
    };

    let node_stats = state.queue.stats();

    let recent = state
        .jobs
        .list(
            JobFilter {
                user_id: scope_user,
                status: None,
            },
            10,
        )
        .await
        .map_err(DispatchError::Internal)?;
    let recent_jobs = recent
        .into_iter()
        .map(|job| {
            let duration_seconds = match (job.started_at, job.completed_at) {
                (Some(start), Some(end)) => Some((end - start).num_seconds()),
                _ => None,
            };
            RecentJob {
                job_id: job.id,
                user_id: job.owner_user_id,
                competition_id: job.competition_id,
                status: job.status,
                node_id: job.assigned_node_id,
                created_at: job.created_at,
                started_at: job.started_at,
                completed_at: job.completed_at,
                duration_seconds,
            }
        })
        .collect();

    // total_wait is the queue manager's load figure, which spans both
    // queued and running jobs (§8 invariant 3); `length` is just the FIFO
    // depth and goes to 0 the moment a node's one job is dequeued to run,
    // which would undercount the common steady state of "node is busy".
    let busy_nodes = node_stats.iter().filter(|n| n.total_wait > 0).count();
    let utilization = busy_nodes as f64 / node_stats.len().max(1) as f64;

    let terminal_sample = state.jobs.recent_terminal(100).await.map_err(DispatchError::Internal)?;
    let success_rate = if terminal_sample.is_empty() {
        1.0
    } else {
        terminal_sample.iter().filter(|j| j.status == JobStatus::Completed).count() as f64
            / terminal_sample.len() as f64
    };

    let day_ago = chrono::Utc::now() - chrono::Duration::hours(24);
    let jobs_last_24h = all_jobs.iter().filter(|j| j.created_at >= day_ago).count();

    Ok(Json(DashboardResponse {
        job_stats,
        user_stats,
        node_stats,
        recent_jobs,
        health: HealthMetrics {
            utilization,
            success_rate,
            jobs_last_24h,
        },
    }))
}
