//! `POST /cancel/{id}` (§4.H, §5 cancellation semantics).

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::common::DispatchError;
use crate::kernel::jobs::{JobStatus, JobUpdate};
use crate::server::middleware::AuthUser;
use crate::server::state::AppState;

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub message: String,
    pub status: JobStatus,
}

pub async fn cancel(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, DispatchError> {
    let job = state
        .jobs
        .get(job_id)
        .await
        .map_err(DispatchError::Internal)?
        .ok_or(DispatchError::NotFound(job_id))?;

    auth.owns_or_admin(&job.owner_user_id)?;

    if job.status.is_terminal() {
        return Err(DispatchError::AlreadyTerminal(job.status.as_str().to_string()));
    }

    if job.status == JobStatus::Pending {
        let node_id = job.assigned_node_id.ok_or_else(|| {
            DispatchError::Internal(anyhow::anyhow!("pending job {job_id} has no assigned node"))
        })?;

        let removed = state
            .queue
            .remove(job_id, node_id as usize, job.expected_time_seconds as i64);

        state.jobs.update(job_id, JobUpdate::cancelled()).await.map_err(DispatchError::Internal)?;

        let message = if removed {
            "Job cancelled successfully".to_string()
        } else {
            // It may have just been dequeued by the worker; the worker
            // will observe the cancelled status on its next supervision poll.
            "Job marked for cancellation".to_string()
        };
        return Ok(Json(CancelResponse {
            message,
            status: JobStatus::Cancelled,
        }));
    }

    // status == Running
    state.jobs.update(job_id, JobUpdate::cancelled()).await.map_err(DispatchError::Internal)?;

    if let (Some(node_id), Some(pid)) = (job.assigned_node_id, job.remote_pid) {
        if let Some(executor) = state.executors.get(node_id as usize) {
            if let Err(e) = executor.kill(pid).await {
                tracing::warn!(%job_id, node_id, pid, error = %e, "best-effort kill on cancel failed");
            }
        }
    }

    Ok(Json(CancelResponse {
        message: "Job cancelled successfully".to_string(),
        status: JobStatus::Cancelled,
    }))
}
