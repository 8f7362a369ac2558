//! Worker (component F) — one long-running task per node.
//!
//! Drains its node's queue sequentially (never touches its executor
//! concurrently) and drives each job through pending → connecting →
//! starting → supervising → reaping → terminal, per §4.F.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::executor::RemoteExecutor;
use super::job::{Job, JobStatus};
use super::queue::QueueManager;
use super::store::{JobStore, JobUpdate};
use crate::config::Config;

pub struct Worker {
    node_id: usize,
    executor: Arc<RemoteExecutor>,
    queue: Arc<QueueManager>,
    store: Arc<dyn JobStore>,
    config: Arc<Config>,
}

impl Worker {
    pub fn new(
        node_id: usize,
        executor: Arc<RemoteExecutor>,
        queue: Arc<QueueManager>,
        store: Arc<dyn JobStore>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            node_id,
            executor,
            queue,
            store,
            config,
        }
    }

    /// Runs until the process shuts down. Never returns early on a single
    /// job's failure — a job that cannot be resolved is terminated with a
    /// diagnostic and the loop continues (§7: "workers never exit").
    pub async fn run(self) {
        loop {
            match self.queue.dequeue(self.node_id) {
                Some(job_id) => {
                    if let Err(e) = self.drive_job(job_id).await {
                        tracing::error!(node_id = self.node_id, %job_id, error = %e, "job processing hit an unrecoverable error");
                    }
                }
                None => tokio::time::sleep(self.config.worker_poll_interval).await,
            }
        }
    }

    async fn drive_job(&self, job_id: Uuid) -> anyhow::Result<()> {
        let job = match self.store.get(job_id).await? {
            Some(job) => job,
            None => {
                tracing::error!(node_id = self.node_id, %job_id, "dequeued job has no store row");
                return Ok(());
            }
        };

        tracing::info!(node_id = self.node_id, %job_id, "job dequeued, connecting");
        self.store.update(job_id, JobUpdate::start(self.node_id as i32)).await?;

        if !self.executor.ensure_connected().await {
            tracing::warn!(node_id = self.node_id, %job_id, "connect failed, terminating job");
            self.fail(job_id, job.expected_time_seconds, "failed to establish ssh connection to node")
                .await?;
            return Ok(());
        }

        tracing::info!(node_id = self.node_id, %job_id, "starting remote process");
        let local_script = PathBuf::from(&job.code_path);
        let pid = match self.executor.launch(&job_id.to_string(), &local_script, &job.competition_id).await {
            Ok(pid) => pid,
            Err(e) => {
                tracing::warn!(node_id = self.node_id, %job_id, error = %e, "launch failed, terminating job");
                self.fail(job_id, job.expected_time_seconds, &format!("launch failed: {e}"))
                    .await?;
                return Ok(());
            }
        };
        self.store.update(job_id, JobUpdate::set_remote_pid(pid)).await?;
        tracing::info!(node_id = self.node_id, %job_id, pid, "process launched, supervising");

        let outcome = self.supervise(job_id, pid, job.expected_time_seconds, job.started_at).await;
        self.reap(&job, outcome).await
    }

    /// Polls liveness, timeout, and the cooperative cancellation flag every
    /// `supervision_poll_interval` until one of them fires.
    async fn supervise(
        &self,
        job_id: Uuid,
        pid: i32,
        expected_time_seconds: i32,
        started_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> SuperviseOutcome {
        let timeout = Duration::from_secs(expected_time_seconds as u64 * self.config.timeout_multiplier as u64);
        let started_at = started_at.unwrap_or_else(chrono::Utc::now);

        loop {
            tokio::time::sleep(self.config.supervision_poll_interval).await;

            if !self.executor.is_alive(pid).await {
                return SuperviseOutcome::Exited;
            }

            let elapsed = chrono::Utc::now().signed_duration_since(started_at);
            if elapsed.num_seconds() as u64 > timeout.as_secs() {
                tracing::warn!(node_id = self.node_id, %job_id, "job exceeded timeout, killing");
                let _ = self.executor.kill(pid).await;
                return SuperviseOutcome::TimedOut;
            }

            match self.store.get(job_id).await {
                Ok(Some(job)) if job.status == JobStatus::Cancelled => {
                    tracing::info!(node_id = self.node_id, %job_id, "cancellation observed, killing");
                    let _ = self.executor.kill(pid).await;
                    return SuperviseOutcome::Cancelled;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(node_id = self.node_id, %job_id, error = %e, "failed to poll job row during supervision");
                }
            }
        }
    }

    /// Fetches outputs, mirrors non-empty results to disk, persists the
    /// terminal row, releases node load and, optionally, recycles the
    /// node's container before taking the next job.
    async fn reap(&self, job: &Job, outcome: SuperviseOutcome) -> anyhow::Result<()> {
        let job_id = job.id;
        let job_id_str = job_id.to_string();
        let fetched = self
            .executor
            .fetch_outputs(&job_id_str, self.config.output_fetch_max_retries)
            .await;

        let (stdout, stderr, exit_code) = match fetched {
            Ok((results, stdout, stderr)) => {
                // The process is launched detached and its real exit status
                // is not observable after the fact; a clean (non-killed)
                // exit is recorded as success, matching the reference
                // worker's behavior.
                let exit_code = matches!(outcome, SuperviseOutcome::Exited).then_some(0);
                if !results.trim().is_empty() {
                    self.mirror_results(job, &results).await;
                }
                (stdout, stderr, exit_code)
            }
            Err(e) => {
                tracing::warn!(node_id = self.node_id, %job_id, error = %e, "failed to fetch outputs after retries");
                (String::new(), format!("failed to fetch outputs: {e}"), None)
            }
        };

        let status = match outcome {
            SuperviseOutcome::Cancelled => JobStatus::Cancelled,
            SuperviseOutcome::TimedOut => JobStatus::Failed,
            SuperviseOutcome::Exited => {
                if exit_code == Some(0) {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                }
            }
        };

        let stderr = match outcome {
            SuperviseOutcome::TimedOut => format!("job exceeded its timeout budget\n{stderr}"),
            _ => stderr,
        };

        self.store
            .update(
                job_id,
                JobUpdate::terminal(status, Some(stdout), Some(stderr), exit_code),
            )
            .await?;

        self.executor.cleanup(&job_id_str).await;
        self.queue.complete(self.node_id, job.expected_time_seconds as i64);

        if self.config.container_restart_between_jobs {
            let name = format!("{}-{}", self.config.container_name_prefix, self.node_id);
            if let Err(e) = self
                .executor
                .restart_container(&name, self.config.container_restart_warmup)
                .await
            {
                tracing::warn!(node_id = self.node_id, error = %e, "container restart failed");
            }
        }

        tracing::info!(node_id = self.node_id, %job_id, status = status.as_str(), "job reaped");
        Ok(())
    }

    /// Mirrors a completed job's results to `jobs/results/<user>_<competition>_<UTC timestamp>.jsonl`
    /// (§6 persisted layout). Best-effort: a write failure is logged, not propagated, since the
    /// authoritative copy of `results` already lives in the terminal job row.
    async fn mirror_results(&self, job: &Job, results: &str) {
        let job_id = job.id;
        let dir = PathBuf::from(&self.config.jobs_dir).join("results");
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            tracing::warn!(%job_id, error = %e, "failed to create results mirror directory");
            return;
        }
        let file_name = format!(
            "{}_{}_{}.jsonl",
            job.owner_user_id,
            job.competition_id,
            chrono::Utc::now().format("%Y%m%dT%H%M%SZ"),
        );
        if let Err(e) = tokio::fs::write(dir.join(file_name), results).await {
            tracing::warn!(%job_id, error = %e, "failed to mirror results to disk");
        }
    }

    async fn fail(&self, job_id: Uuid, expected_time_seconds: i32, diagnostic: &str) -> anyhow::Result<()> {
        self.store
            .update(
                job_id,
                JobUpdate::terminal(JobStatus::Failed, None, Some(diagnostic.to_string()), None),
            )
            .await?;
        self.queue.complete(self.node_id, expected_time_seconds as i64);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum SuperviseOutcome {
    Exited,
    TimedOut,
    Cancelled,
}

/// Owns one `Worker` task handle per node.
pub struct WorkerPool {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns one worker per executor. `executors` must be in node-id order.
    pub fn spawn(
        executors: Vec<Arc<RemoteExecutor>>,
        queue: Arc<QueueManager>,
        store: Arc<dyn JobStore>,
        config: Arc<Config>,
    ) -> Self {
        let handles = executors
            .into_iter()
            .enumerate()
            .map(|(node_id, executor)| {
                let worker = Worker::new(node_id, executor, queue.clone(), store.clone(), config.clone());
                tokio::spawn(worker.run())
            })
            .collect();
        Self { handles }
    }

    pub fn abort_all(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}
