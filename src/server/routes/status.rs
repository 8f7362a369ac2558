//! `GET /status/{id}` (§4.H).

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::common::DispatchError;
use crate::kernel::jobs::JobStatus;
use crate::server::middleware::AuthUser;
use crate::server::state::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub node_id: Option<i32>,
    pub queue_position: Option<usize>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub exit_code: Option<i32>,
}

pub async fn status(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<StatusResponse>, DispatchError> {
    let job = state
        .jobs
        .get(job_id)
        .await
        .map_err(DispatchError::Internal)?
        .ok_or(DispatchError::NotFound(job_id))?;

    auth.owns_or_admin(&job.owner_user_id)?;

    let queue_position = match (job.status, job.assigned_node_id) {
        (JobStatus::Pending, Some(node_id)) => state.queue.position(job_id, node_id as usize),
        _ => None,
    };

    Ok(Json(StatusResponse {
        job_id,
        status: job.status,
        node_id: job.assigned_node_id,
        queue_position,
        created_at: job.created_at,
        started_at: job.started_at,
        completed_at: job.completed_at,
        exit_code: job.exit_code,
    }))
}
