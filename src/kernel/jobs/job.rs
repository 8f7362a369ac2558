//! Job entity (§3) — the durable record tying admission, placement, and
//! remote execution together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses permit no further transitions (§3 invariants).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Durable job row (§3).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    pub owner_user_id: String,
    pub competition_id: String,
    pub project_id: String,
    pub expected_time_seconds: i32,
    pub token_fingerprint: String,

    #[builder(default)]
    pub status: JobStatus,
    #[builder(default, setter(strip_option))]
    pub assigned_node_id: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub remote_pid: Option<i32>,

    #[builder(default, setter(strip_option))]
    pub stdout_blob: Option<String>,
    #[builder(default, setter(strip_option))]
    pub stderr_blob: Option<String>,
    #[builder(default, setter(strip_option))]
    pub exit_code: Option<i32>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,

    pub code_path: String,
    pub config_path: String,
}

impl Job {
    /// Invariant (§3): exit_code set iff status == completed.
    pub fn check_invariants(&self) -> Result<(), String> {
        match self.status {
            JobStatus::Pending => {
                if self.started_at.is_some()
                    || self.completed_at.is_some()
                    || self.remote_pid.is_some()
                {
                    return Err("pending job must have no started_at/completed_at/remote_pid".into());
                }
            }
            JobStatus::Running => {
                if self.assigned_node_id.is_none() || self.started_at.is_none() || self.completed_at.is_some() {
                    return Err("running job must have assigned_node_id and started_at, and no completed_at".into());
                }
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                if self.completed_at.is_none() {
                    return Err("terminal job must have completed_at".into());
                }
            }
        }
        if self.status == JobStatus::Completed && self.exit_code.is_none() {
            return Err("completed job must have an exit_code".into());
        }
        if self.status != JobStatus::Completed && self.exit_code.is_some() {
            return Err("only completed jobs may carry an exit_code".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_job() -> Job {
        Job::builder()
            .owner_user_id("alice")
            .competition_id("comp-1")
            .project_id("proj-1")
            .expected_time_seconds(10)
            .token_fingerprint("fp")
            .code_path("jobs/x/script.py")
            .config_path("jobs/x/config.yaml")
            .build()
    }

    #[test]
    fn pending_job_satisfies_invariants() {
        assert!(base_job().check_invariants().is_ok());
    }

    #[test]
    fn running_job_without_started_at_is_invalid() {
        let mut job = base_job();
        job.status = JobStatus::Running;
        job.assigned_node_id = Some(0);
        assert!(job.check_invariants().is_err());
    }

    #[test]
    fn completed_job_requires_exit_code() {
        let mut job = base_job();
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        assert!(job.check_invariants().is_err());
        job.exit_code = Some(0);
        assert!(job.check_invariants().is_ok());
    }

    #[test]
    fn terminal_statuses_are_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
