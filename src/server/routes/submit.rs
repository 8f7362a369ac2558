//! `POST /submit` — the admission pipeline (§4.H): per-address limiter,
//! config parsing, token validation, code vetting, per-user limiter,
//! concurrency gate, persistence, queue placement, and a bounded
//! submit-and-wait poll.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::extract::{ConnectInfo, Multipart, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::DispatchError;
use crate::kernel::jobs::{Job, JobStatus, JobUpdate};
use crate::kernel::limiter::{endpoint_rate_message, submission_rate_message};
use crate::kernel::tokens::fingerprint;
use crate::server::state::AppState;

#[derive(Debug, Deserialize)]
struct SubmissionConfig {
    competition_id: String,
    project_id: String,
    user_id: String,
    expected_time: i32,
    token: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub node_id: usize,
    pub status: JobStatus,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub async fn submit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut multipart: Multipart,
) -> Result<Json<SubmitResponse>, DispatchError> {
    let decision = state.limiter.per_address.check(
        &addr.ip().to_string(),
        state.config.limiter.address_submit_max,
        state.config.limiter.address_submit_window,
    );
    if !decision.is_allowed() {
        return Err(DispatchError::RateLimited(endpoint_rate_message(
            &decision,
            state.config.limiter.address_submit_max,
            state.config.limiter.address_submit_window,
        )));
    }

    let mut code_bytes: Option<Vec<u8>> = None;
    let mut config_bytes: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| DispatchError::Internal(anyhow::anyhow!(e)))?
    {
        match field.name() {
            Some("code") => {
                code_bytes = Some(field.bytes().await.map_err(|e| DispatchError::Internal(anyhow::anyhow!(e)))?.to_vec())
            }
            Some("config_file") => {
                config_bytes = Some(field.bytes().await.map_err(|e| DispatchError::Internal(anyhow::anyhow!(e)))?.to_vec())
            }
            _ => {}
        }
    }

    let code_bytes = code_bytes.ok_or_else(|| DispatchError::MissingField("code".to_string()))?;
    let config_bytes = config_bytes.ok_or_else(|| DispatchError::MissingField("config_file".to_string()))?;

    let job_config: SubmissionConfig = serde_yaml::from_slice(&config_bytes)
        .map_err(|e| DispatchError::InvalidYaml(e.to_string()))?;

    let identity = state
        .tokens
        .validate(&job_config.token)
        .await
        .map_err(DispatchError::Internal)?
        .ok_or(DispatchError::InvalidToken)?;

    // Ownership check on /submit: the declared user_id is redundant with the
    // token binding but is still validated against client error.
    if identity.user_id != job_config.user_id {
        return Err(DispatchError::Forbidden);
    }

    let code_source = String::from_utf8_lossy(&code_bytes).into_owned();
    if state.config.vetter.enabled {
        let verdict = state.vetter.vet(&code_source, &job_config.competition_id).await;
        if !verdict.safe {
            return Err(DispatchError::UnsafeCode(verdict.issues.join(", ")));
        }
        if !verdict.relevant {
            return Err(DispatchError::IrrelevantCode(verdict.explanation));
        }
    }

    let decision = state.limiter.per_user.check(
        &identity.user_id,
        state.config.limiter.user_submit_max,
        state.config.limiter.user_submit_window,
    );
    if !decision.is_allowed() {
        return Err(DispatchError::RateLimited(submission_rate_message(
            &decision,
            state.config.limiter.user_submit_max,
            state.config.limiter.user_submit_window,
        )));
    }

    let active = state
        .jobs
        .count_active_for(&identity.user_id)
        .await
        .map_err(DispatchError::Internal)?;
    if active >= 1 {
        return Err(DispatchError::QueueLimit(format!(
            "You already have {active} job(s) in progress. Maximum 1 job per user allowed."
        )));
    }

    let job_id = Uuid::new_v4();
    let job_dir = PathBuf::from(&state.config.jobs_dir).join(job_id.to_string());
    tokio::fs::create_dir_all(&job_dir)
        .await
        .map_err(|e| DispatchError::Internal(anyhow::anyhow!(e)))?;

    let code_path = job_dir.join("script.py");
    tokio::fs::write(&code_path, &code_bytes)
        .await
        .map_err(|e| DispatchError::Internal(anyhow::anyhow!(e)))?;
    let config_path = job_dir.join("config.yaml");
    tokio::fs::write(&config_path, &config_bytes)
        .await
        .map_err(|e| DispatchError::Internal(anyhow::anyhow!(e)))?;

    let job = Job::builder()
        .id(job_id)
        .owner_user_id(job_config.user_id.clone())
        .competition_id(job_config.competition_id.clone())
        .project_id(job_config.project_id.clone())
        .expected_time_seconds(job_config.expected_time)
        .token_fingerprint(fingerprint(&job_config.token))
        .code_path(code_path.to_string_lossy().into_owned())
        .config_path(config_path.to_string_lossy().into_owned())
        .build();

    state.jobs.insert(job).await.map_err(DispatchError::Internal)?;
    let node_id = state.queue.assign(job_id, job_config.expected_time as i64);

    // §3: assigned_node_id is null until placement, so it must be persisted
    // here rather than waiting for the worker to dequeue the job.
    state
        .jobs
        .update(
            job_id,
            JobUpdate {
                assigned_node_id: Some(Some(node_id as i32)),
                ..Default::default()
            },
        )
        .await
        .map_err(DispatchError::Internal)?;

    let deadline = tokio::time::Instant::now() + state.config.submit_wait_timeout;
    loop {
        let job = state
            .jobs
            .get(job_id)
            .await
            .map_err(DispatchError::Internal)?
            .ok_or(DispatchError::NotFound(job_id))?;

        if job.status.is_terminal() {
            return Ok(Json(SubmitResponse {
                job_id,
                node_id,
                status: job.status,
                stdout: job.stdout_blob,
                stderr: job.stderr_blob,
                exit_code: job.exit_code,
                started_at: job.started_at,
                completed_at: job.completed_at,
                message: None,
            }));
        }

        if tokio::time::Instant::now() >= deadline {
            return Ok(Json(SubmitResponse {
                job_id,
                node_id,
                status: job.status,
                stdout: None,
                stderr: None,
                exit_code: None,
                started_at: job.started_at,
                completed_at: None,
                message: Some(format!(
                    "Timeout after {}s. Job still {}. Use /results/{job_id} to check later.",
                    state.config.submit_wait_timeout.as_secs(),
                    job.status.as_str(),
                )),
            }));
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
