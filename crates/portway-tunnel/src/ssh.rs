//! SSH child processes and remote-side probes.
//!
//! SSH stays an external process: the reverse tunnel is an `ssh -N -R`
//! child (wrapped by `autossh -M 0` when available, and by `sshpass` for
//! password authentication), and the probes are short remote commands run
//! over fresh SSH connections.

use crate::endpoint::Endpoint;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Wall-clock budget for the remote port probe.
const REMOTE_PROBE_TIMEOUT: Duration = Duration::from_secs(8);
/// Per-attempt budget for the connectivity validation.
const CONNECTIVITY_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECTIVITY_RETRY_DELAY: Duration = Duration::from_secs(2);
const CONNECTIVITY_ATTEMPTS: u32 = 3;
/// Budget for the key-auth detection probe.
const KEY_DETECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How the SSH child authenticates.
#[derive(Debug, Clone)]
pub enum SshAuth {
    /// Keys resolved by ssh itself (agent or default identity files)
    Key,
    /// Password supplied through `sshpass`
    Password(String),
}

/// One SSH destination plus its authentication method.
#[derive(Debug, Clone)]
pub struct SshClient {
    host: String,
    port: u16,
    user: String,
    auth: SshAuth,
}

impl SshClient {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            auth,
        }
    }

    pub fn for_endpoint(endpoint: &Endpoint) -> Self {
        Self::new(
            endpoint.remote_host.clone(),
            endpoint.ssh_port,
            endpoint.remote_user.clone(),
            endpoint.auth.clone(),
        )
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// argv for running one remote command (without wrapper programs).
    fn remote_args(&self, connect_timeout: u32, batch_mode: bool, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_timeout),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
        ];
        if batch_mode {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
            args.push("-o".to_string());
            args.push("PasswordAuthentication=no".to_string());
        }
        args.push("-p".to_string());
        args.push(self.port.to_string());
        args.push(self.destination());
        args.push(command.to_string());
        args
    }

    /// argv for the reverse-tunnel child (without wrapper programs).
    pub fn reverse_tunnel_args(&self, remote_port: u16, local_port: u16) -> Vec<String> {
        let mut args = Vec::new();
        for option in [
            "ConnectTimeout=30",
            "ServerAliveInterval=5",
            "ServerAliveCountMax=3",
            "TCPKeepAlive=yes",
            "ExitOnForwardFailure=yes",
            "StrictHostKeyChecking=no",
            "Compression=yes",
        ] {
            args.push("-o".to_string());
            args.push(option.to_string());
        }
        args.push("-N".to_string());
        args.push("-R".to_string());
        args.push(format!(
            "127.0.0.1:{}:127.0.0.1:{}",
            remote_port, local_port
        ));
        args.push("-p".to_string());
        args.push(self.port.to_string());
        args.push(self.destination());
        args
    }

    /// Wrap a program invocation with `sshpass` for password auth.
    fn command(&self, program: &str, args: Vec<String>) -> Command {
        match &self.auth {
            SshAuth::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-p").arg(password).arg(program);
                cmd.args(args);
                cmd
            }
            SshAuth::Key => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
        }
    }

    async fn run_remote(
        &self,
        connect_timeout: u32,
        remote_command: &str,
        deadline: Duration,
    ) -> Option<std::process::Output> {
        let mut cmd = self.command("ssh", self.remote_args(connect_timeout, false, remote_command));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match timeout(deadline, cmd.output()).await {
            Ok(Ok(output)) => Some(output),
            Ok(Err(err)) => {
                warn!(host = %self.host, error = %err, "failed to run ssh");
                None
            }
            Err(_) => {
                debug!(host = %self.host, "remote command deadline expired");
                None
            }
        }
    }

    /// True iff a TCP connect to `127.0.0.1:<remote_port>` succeeds on the
    /// remote side.
    pub async fn probe_remote_port(&self, remote_port: u16) -> bool {
        let command = format!(
            "timeout 2 bash -c '</dev/tcp/127.0.0.1/{}' 2>/dev/null",
            remote_port
        );
        self.run_remote(3, &command, REMOTE_PROBE_TIMEOUT)
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Validate that the remote host is reachable at all, with retries.
    pub async fn check_connectivity(&self) -> bool {
        for attempt in 1..=CONNECTIVITY_ATTEMPTS {
            if let Some(output) = self
                .run_remote(10, "echo 'SSH_TEST_SUCCESS'", CONNECTIVITY_ATTEMPT_TIMEOUT)
                .await
            {
                if output.status.success()
                    && String::from_utf8_lossy(&output.stdout).contains("SSH_TEST_SUCCESS")
                {
                    return true;
                }
            }
            if attempt < CONNECTIVITY_ATTEMPTS {
                warn!(
                    attempt,
                    total = CONNECTIVITY_ATTEMPTS,
                    "SSH connectivity test failed, retrying"
                );
                tokio::time::sleep(CONNECTIVITY_RETRY_DELAY).await;
            }
        }
        false
    }

    /// Detect whether key authentication works for this destination.
    ///
    /// Always runs plain `ssh` in batch mode, never through `sshpass`, so a
    /// configured password does not mask a working key.
    pub async fn detect_key_auth(&self) -> bool {
        let mut cmd = Command::new("ssh");
        cmd.args(self.remote_args(5, true, "echo test"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        matches!(
            timeout(KEY_DETECT_TIMEOUT, cmd.status()).await,
            Ok(Ok(status)) if status.success()
        )
    }

    /// Spawn the reverse-tunnel child for one endpoint.
    ///
    /// Uses `autossh -M 0` when available so repeated forwarding failures
    /// surface as a child exit the supervisor can observe.
    pub fn spawn_reverse_tunnel(
        &self,
        remote_port: u16,
        local_port: u16,
    ) -> std::io::Result<Child> {
        let args = self.reverse_tunnel_args(remote_port, local_port);
        let mut cmd = if autossh_available() {
            let mut wrapped = vec!["-M".to_string(), "0".to_string()];
            wrapped.extend(args);
            self.command("autossh", wrapped)
        } else {
            self.command("ssh", args)
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.spawn()
    }
}

/// Look for `autossh` on PATH.
fn autossh_available() -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join("autossh").is_file()))
        .unwrap_or(false)
}
