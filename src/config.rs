//! Process-wide configuration, loaded once at startup from the environment.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Address of a single compute node, reachable only through the bastion.
#[derive(Debug, Clone)]
pub struct NodeAddress {
    pub node_id: usize,
    pub ip: String,
}

/// SSH connection parameters for the bastion and the per-node credentials
/// used once the bastion has tunneled a channel to the target node.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub bastion_host: String,
    pub bastion_user: String,
    pub bastion_key_path: Option<String>,
    pub node_port: u16,
    pub node_username: String,
    pub node_password: String,
    pub connect_timeout: Duration,
    pub retry_attempts: u32,
    pub keepalive_interval: Duration,
}

/// Remote filesystem layout used by the worker/executor when launching and
/// reaping a job on a node. All paths are templated with the job id.
#[derive(Debug, Clone)]
pub struct RemotePaths {
    pub work_dir: String,
    pub script_name: String,
    pub results_name: String,
    pub stdout_template: String,
    pub stderr_template: String,
    pub grading_interpreter: String,
    pub grading_script: String,
}

impl RemotePaths {
    pub fn remote_script(&self) -> String {
        format!("{}/{}", self.work_dir, self.script_name)
    }

    pub fn remote_results(&self) -> String {
        format!("{}/{}", self.work_dir, self.results_name)
    }

    pub fn remote_stdout(&self, job_id: &str) -> String {
        self.stdout_template.replace("{job_id}", job_id)
    }

    pub fn remote_stderr(&self, job_id: &str) -> String {
        self.stderr_template.replace("{job_id}", job_id)
    }
}

/// Tunables for the code vetter (§4.C).
#[derive(Debug, Clone)]
pub struct VetterConfig {
    pub enabled: bool,
    pub quick_mode: bool,
    pub api_key: Option<String>,
    pub api_url: String,
    pub model: String,
    pub request_timeout: Duration,
}

/// Tunables for the sliding-window limiter (§4.B).
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub user_submit_max: u32,
    pub user_submit_window: Duration,
    pub address_submit_max: u32,
    pub address_submit_window: Duration,
    pub address_read_max: u32,
    pub address_read_window: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            user_submit_max: 5,
            user_submit_window: Duration::from_secs(60),
            address_submit_max: 100,
            address_submit_window: Duration::from_secs(60),
            address_read_max: 200,
            address_read_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub jobs_dir: String,
    pub nodes: Vec<NodeAddress>,
    pub ssh: SshConfig,
    pub remote_paths: RemotePaths,
    pub vetter: VetterConfig,
    pub limiter: LimiterConfig,
    pub timeout_multiplier: u32,
    pub worker_poll_interval: Duration,
    pub supervision_poll_interval: Duration,
    pub output_fetch_max_retries: u32,
    pub submit_wait_timeout: Duration,
    pub container_restart_between_jobs: bool,
    pub container_name_prefix: String,
    pub container_restart_warmup: Duration,
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// development-sized defaults where a missing value isn't fatal.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8001".to_string())
            .parse()
            .context("SERVER_PORT must be a valid port number")?;

        let jobs_dir = env::var("JOBS_DIR").unwrap_or_else(|_| "./jobs".to_string());

        let node_count: usize = env::var("NODE_COUNT")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .context("NODE_COUNT must be a valid integer")?;
        let nodes = match env::var("NODE_IPS") {
            Ok(raw) => raw
                .split(',')
                .enumerate()
                .map(|(node_id, ip)| NodeAddress {
                    node_id,
                    ip: ip.trim().to_string(),
                })
                .collect(),
            Err(_) => (0..node_count)
                .map(|node_id| NodeAddress {
                    node_id,
                    ip: format!("10.0.0.{}", 10 + node_id),
                })
                .collect(),
        };

        let ssh = SshConfig {
            bastion_host: env::var("BASTION_HOST").context("BASTION_HOST must be set")?,
            bastion_user: env::var("BASTION_USER").context("BASTION_USER must be set")?,
            bastion_key_path: env::var("BASTION_SSH_KEY").ok(),
            node_port: env::var("NODE_SSH_PORT")
                .unwrap_or_else(|_| "22".to_string())
                .parse()
                .context("NODE_SSH_PORT must be a valid port number")?,
            node_username: env::var("NODE_SSH_USERNAME")
                .context("NODE_SSH_USERNAME must be set")?,
            node_password: env::var("NODE_SSH_PASSWORD")
                .context("NODE_SSH_PASSWORD must be set")?,
            connect_timeout: Duration::from_secs(
                env::var("SSH_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .context("SSH_TIMEOUT_SECS must be a valid integer")?,
            ),
            retry_attempts: env::var("SSH_RETRY_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("SSH_RETRY_ATTEMPTS must be a valid integer")?,
            keepalive_interval: Duration::from_secs(60),
        };

        let remote_paths = RemotePaths {
            work_dir: env::var("REMOTE_WORK_DIR")
                .unwrap_or_else(|_| "/home/gpuuser/work".to_string()),
            script_name: "solution.py".to_string(),
            results_name: "results.jsonl".to_string(),
            stdout_template: "/tmp/job_{job_id}.out".to_string(),
            stderr_template: "/tmp/job_{job_id}.err".to_string(),
            grading_interpreter: env::var("GRADING_INTERPRETER")
                .unwrap_or_else(|_| "/usr/bin/python3".to_string()),
            grading_script: env::var("GRADING_SCRIPT")
                .unwrap_or_else(|_| "/opt/dojo/grade_code.py".to_string()),
        };

        let vetter = VetterConfig {
            enabled: env::var("CODE_SCANNER_ENABLED")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            quick_mode: env::var("CODE_SCANNER_QUICK_MODE")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            api_key: env::var("OPENROUTER_API_KEY").ok(),
            api_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            model: env::var("CODE_SCANNER_MODEL")
                .unwrap_or_else(|_| "anthropic/claude-3.5-sonnet".to_string()),
            request_timeout: Duration::from_secs(30),
        };

        Ok(Self {
            database_url,
            server_host,
            server_port,
            jobs_dir,
            nodes,
            ssh,
            remote_paths,
            vetter,
            limiter: LimiterConfig::default(),
            timeout_multiplier: env::var("MAX_JOB_TIMEOUT_MULTIPLIER")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("MAX_JOB_TIMEOUT_MULTIPLIER must be a valid integer")?,
            worker_poll_interval: Duration::from_secs(1),
            supervision_poll_interval: Duration::from_secs(2),
            output_fetch_max_retries: 5,
            submit_wait_timeout: Duration::from_secs(300),
            container_restart_between_jobs: env::var("LXC_RESTART_BETWEEN_JOBS")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            container_name_prefix: env::var("LXC_CONTAINER_PREFIX")
                .unwrap_or_else(|_| "gpu-node".to_string()),
            container_restart_warmup: Duration::from_secs(30),
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
