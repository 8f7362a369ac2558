//! `GET /jobs` (§4.H): admin sees all, non-admin is force-filtered to self.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::DispatchError;
use crate::kernel::jobs::{JobFilter, JobStatus};
use crate::server::middleware::AuthUser;
use crate::server::state::AppState;

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    user_id: Option<String>,
    status: Option<JobStatus>,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub user_id: String,
    pub status: JobStatus,
    pub node_id: Option<i32>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<JobSummary>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<JobsQuery>,
) -> Result<Json<JobsResponse>, DispatchError> {
    let user_id = if auth.is_admin { query.user_id } else { Some(auth.user_id) };

    let jobs = state
        .jobs
        .list(
            JobFilter {
                user_id,
                status: query.status,
            },
            query.limit,
        )
        .await
        .map_err(DispatchError::Internal)?;

    Ok(Json(JobsResponse {
        jobs: jobs
            .into_iter()
            .map(|job| JobSummary {
                job_id: job.id,
                user_id: job.owner_user_id,
                status: job.status,
                node_id: job.assigned_node_id,
                created_at: job.created_at,
                completed_at: job.completed_at,
            })
            .collect(),
    }))
}
