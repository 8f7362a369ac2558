//! Remote Executor (component E).
//!
//! One instance per node. `ssh2` is a synchronous binding to libssh2, so
//! every call that touches a session runs inside `tokio::task::block_in_place`
//! — it blocks the current worker thread rather than spawning a new task,
//! which lets the blocking closures borrow `self` and the session guard
//! directly instead of juggling `Send + 'static` ownership.

use anyhow::{anyhow, bail, Context, Result};
use ssh2::Session;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::block_in_place;
use tokio::time::sleep;

use crate::config::{RemotePaths, SshConfig};

/// A connected pair of SSH sessions: one to the bastion, one to the target
/// node, negotiated over a direct-tcpip channel opened on the bastion
/// session (§4.E).
struct Connection {
    bastion: Session,
    node: Session,
}

pub struct RemoteExecutor {
    node_id: usize,
    node_ip: String,
    ssh: SshConfig,
    paths: RemotePaths,
    conn: Mutex<Option<Connection>>,
}

impl RemoteExecutor {
    pub fn new(node_id: usize, node_ip: String, ssh: SshConfig, paths: RemotePaths) -> Self {
        Self {
            node_id,
            node_ip,
            ssh,
            paths,
            conn: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> usize {
        self.node_id
    }

    /// Open the bastion session, tunnel to the node, and authenticate a
    /// second session over the tunnel. Retries the whole handshake up to
    /// `ssh.retry_attempts` times with a fixed backoff.
    pub async fn connect(&self) -> bool {
        for attempt in 1..=self.ssh.retry_attempts {
            match block_in_place(|| self.handshake()) {
                Ok(connection) => {
                    *self.conn.lock().expect("executor mutex poisoned") = Some(connection);
                    return true;
                }
                Err(e) => {
                    tracing::warn!(node_id = self.node_id, attempt, error = %e, "ssh connect attempt failed");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
        false
    }

    fn handshake(&self) -> Result<Connection> {
        let tcp = TcpStream::connect((self.ssh.bastion_host.as_str(), 22))
            .context("failed to open TCP connection to bastion")?;
        tcp.set_read_timeout(Some(self.ssh.connect_timeout))?;

        let mut bastion = Session::new().context("failed to create bastion ssh session")?;
        bastion.set_tcp_stream(tcp);
        bastion.set_timeout(self.ssh.connect_timeout.as_millis() as u32);
        bastion.handshake().context("bastion ssh handshake failed")?;

        if let Some(key_path) = &self.ssh.bastion_key_path {
            bastion
                .userauth_pubkey_file(&self.ssh.bastion_user, None, Path::new(key_path), None)
                .context("bastion key authentication failed")?;
        } else {
            bastion
                .userauth_agent(&self.ssh.bastion_user)
                .context("bastion agent authentication failed")?;
        }
        if !bastion.authenticated() {
            bail!("bastion session did not authenticate");
        }
        bastion.set_keepalive(true, self.ssh.keepalive_interval.as_secs() as u32);

        // Tunnel a direct-tcpip channel from the bastion to the node's SSH
        // port, then negotiate a second session over that channel.
        let channel = bastion
            .channel_direct_tcpip(&self.node_ip, self.ssh.node_port, None)
            .context("failed to open direct-tcpip channel to node")?;

        let mut node = Session::new().context("failed to create node ssh session")?;
        node.set_tcp_stream(channel);
        node.set_timeout(self.ssh.connect_timeout.as_millis() as u32);
        node.handshake().context("node ssh handshake failed")?;
        node.userauth_password(&self.ssh.node_username, &self.ssh.node_password)
            .context("node password authentication failed")?;
        if !node.authenticated() {
            bail!("node session did not authenticate");
        }
        node.set_keepalive(true, self.ssh.keepalive_interval.as_secs() as u32);

        Ok(Connection { bastion, node })
    }

    /// Verify the node transport is alive with a trivial round trip.
    pub async fn healthcheck(&self) -> bool {
        match self.exec("true").await {
            Ok((code, _, _)) => code == 0,
            Err(_) => false,
        }
    }

    /// Re-`connect` if `healthcheck` fails. Returns the resulting
    /// connection status.
    pub async fn ensure_connected(&self) -> bool {
        if self.healthcheck().await {
            return true;
        }
        *self.conn.lock().expect("executor mutex poisoned") = None;
        self.connect().await
    }

    pub async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let data = tokio::fs::read(local)
            .await
            .with_context(|| format!("failed to read local file {}", local.display()))?;
        if !self.ensure_connected().await {
            bail!("node {} not connected", self.node_id);
        }
        block_in_place(|| {
            let guard = self.conn.lock().expect("executor mutex poisoned");
            let conn = guard.as_ref().context("no active connection")?;
            let mut sftp = conn.node.sftp().context("failed to open sftp channel")?;
            let mut file = sftp.create(Path::new(remote)).context("failed to create remote file")?;
            file.write_all(&data).context("failed to write remote file")
        })
    }

    /// Run `cmd` synchronously on the node, reading stdout/stderr to EOF.
    pub async fn exec(&self, cmd: &str) -> Result<(i32, String, String)> {
        if !self.has_connection() {
            if !self.connect().await {
                bail!("node {} not connected", self.node_id);
            }
        }
        block_in_place(|| self.exec_on(cmd, false))
    }

    fn exec_on_bastion(&self, cmd: &str) -> Result<(i32, String, String)> {
        block_in_place(|| self.exec_on(cmd, true))
    }

    fn exec_on(&self, cmd: &str, on_bastion: bool) -> Result<(i32, String, String)> {
        let guard = self.conn.lock().expect("executor mutex poisoned");
        let conn = guard.as_ref().context("no active connection")?;
        let session = if on_bastion { &conn.bastion } else { &conn.node };
        let mut channel = session.channel_session().context("failed to open exec channel")?;
        channel.exec(cmd).context("exec failed")?;
        let mut stdout = String::new();
        channel.read_to_string(&mut stdout).context("failed to read stdout")?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr).context("failed to read stderr")?;
        channel.wait_close().context("failed to close exec channel")?;
        let code = channel.exit_status().context("failed to read exit status")?;
        Ok((code, stdout, stderr))
    }

    fn has_connection(&self) -> bool {
        self.conn.lock().expect("executor mutex poisoned").is_some()
    }

    /// Upload `local_script` to the fixed remote work directory, then launch
    /// the grading command detached from the controlling session so a
    /// transient SSH drop never propagates `SIGHUP` to it (§4.E).
    pub async fn launch(&self, job_id: &str, local_script: &Path, competition_id: &str) -> Result<i32> {
        let remote_script = self.paths.remote_script();
        self.upload(local_script, &remote_script).await?;

        let stdout_path = self.paths.remote_stdout(job_id);
        let stderr_path = self.paths.remote_stderr(job_id);
        let results_path = self.paths.remote_results();

        // setsid detaches the process into a new session; disown drops it
        // from the shell's job table; stdin is tied to /dev/null so EOF on
        // the dropped session can never reach the child.
        let cmd = format!(
            "setsid {interpreter} {grader} --script {script} --results {results} --competition {comp} \
             </dev/null >{stdout} 2>{stderr} & disown; echo $!",
            interpreter = self.paths.grading_interpreter,
            grader = self.paths.grading_script,
            script = remote_script,
            results = results_path,
            comp = competition_id,
            stdout = stdout_path,
            stderr = stderr_path,
        );

        let (code, stdout, stderr) = self.exec(&cmd).await?;
        if code != 0 {
            bail!("launch command exited {code}: {stderr}");
        }
        stdout
            .trim()
            .parse::<i32>()
            .with_context(|| format!("could not parse launched pid from output: {stdout:?}"))
    }

    pub async fn is_alive(&self, pid: i32) -> bool {
        match self.exec(&format!("kill -0 {pid}")).await {
            Ok((code, _, _)) => code == 0,
            Err(_) => false,
        }
    }

    /// `SIGKILL` equivalent.
    pub async fn kill(&self, pid: i32) -> Result<()> {
        let (code, _, stderr) = self.exec(&format!("kill -9 {pid}")).await?;
        if code != 0 && !stderr.contains("No such process") {
            bail!("kill failed: {stderr}");
        }
        Ok(())
    }

    /// Read the three known remote files for `job_id`. On any failure,
    /// `ensure_connected` and retry with exponential backoff up to
    /// `max_retries` attempts; raise after exhaustion (§4.E).
    pub async fn fetch_outputs(&self, job_id: &str, max_retries: u32) -> Result<(String, String, String)> {
        let results_path = self.paths.remote_results();
        let stdout_path = self.paths.remote_stdout(job_id);
        let stderr_path = self.paths.remote_stderr(job_id);

        let mut last_err = None;
        for attempt in 0..=max_retries {
            if attempt > 0 {
                self.ensure_connected().await;
                sleep(Duration::from_secs(5 * attempt as u64)).await;
            }
            let outcome = block_in_place(|| self.read_three_files(&results_path, &stdout_path, &stderr_path));
            match outcome {
                Ok(triple) => return Ok(triple),
                Err(e) => {
                    tracing::warn!(node_id = self.node_id, job_id, attempt, error = %e, "fetch_outputs failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("fetch_outputs exhausted retries with no recorded error")))
    }

    fn read_three_files(&self, results: &str, stdout: &str, stderr: &str) -> Result<(String, String, String)> {
        let guard = self.conn.lock().expect("executor mutex poisoned");
        let conn = guard.as_ref().context("no active connection")?;

        let read_remote = |path: &str| -> Result<String> {
            let mut sftp = conn.node.sftp().context("failed to open sftp channel")?;
            let mut file = sftp
                .open(Path::new(path))
                .with_context(|| format!("failed to open remote file {path}"))?;
            let mut buf = String::new();
            file.read_to_string(&mut buf)
                .with_context(|| format!("failed to read remote file {path}"))?;
            Ok(buf)
        };

        let results_blob = read_remote(results).unwrap_or_default();
        let stdout_blob = read_remote(stdout)?;
        let stderr_blob = read_remote(stderr)?;
        Ok((results_blob, stdout_blob, stderr_blob))
    }

    /// Best-effort removal of the four per-job remote files.
    pub async fn cleanup(&self, job_id: &str) {
        let remote_script = self.paths.remote_script();
        let results = self.paths.remote_results();
        let stdout = self.paths.remote_stdout(job_id);
        let stderr = self.paths.remote_stderr(job_id);
        let cmd = format!("rm -f {remote_script} {results} {stdout} {stderr}");
        if let Err(e) = self.exec(&cmd).await {
            tracing::warn!(node_id = self.node_id, job_id, error = %e, "cleanup failed, continuing");
        }
    }

    /// Issue a container-restart command on the **bastion** session (not
    /// the node session), then sleep for `warmup` and reconnect.
    pub async fn restart_container(&self, name: &str, warmup: Duration) -> Result<()> {
        if !self.has_connection() {
            bail!("node {} not connected; cannot reach bastion", self.node_id);
        }
        let cmd = format!("lxc restart {name}");
        self.exec_on_bastion(&cmd)?;
        sleep(warmup).await;
        if !self.ensure_connected().await {
            bail!("failed to reconnect after container restart");
        }
        Ok(())
    }
}
