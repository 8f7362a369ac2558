//! `GET /results/{id}` (§4.H).

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::common::DispatchError;
use crate::kernel::jobs::JobStatus;
use crate::server::middleware::AuthUser;
use crate::server::state::AppState;

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn results(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ResultsResponse>, DispatchError> {
    let job = state
        .jobs
        .get(job_id)
        .await
        .map_err(DispatchError::Internal)?
        .ok_or(DispatchError::NotFound(job_id))?;

    auth.owns_or_admin(&job.owner_user_id)?;

    Ok(Json(ResultsResponse {
        job_id,
        status: job.status,
        stdout: job.stdout_blob,
        stderr: job.stderr_blob,
        exit_code: job.exit_code,
        started_at: job.started_at,
        completed_at: job.completed_at,
    }))
}
