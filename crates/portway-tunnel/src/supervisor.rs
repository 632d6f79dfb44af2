//! Per-endpoint tunnel supervisor.
//!
//! A [`TunnelSupervisor`] owns one SOCKS5 engine and one SSH reverse-tunnel
//! child and sequences their co-lifetime: the engine starts first and is
//! probed locally, then the SSH child is spawned and both halves are probed
//! together. `create`, `stop` and `recover` are serialized per supervisor;
//! the fleet monitor drives status through [`apply_probe_outcome`].
//!
//! [`apply_probe_outcome`]: TunnelSupervisor::apply_probe_outcome

use crate::endpoint::{Endpoint, FleetConfig};
use crate::pidfile::PidFile;
use crate::ssh::SshClient;
use portway_socks::{
    Credentials, EngineConfig, EngineSnapshot, HealthProbe, Socks5Server,
};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Settle time between engine start and the local probe.
const ENGINE_SETTLE_DELAY: Duration = Duration::from_secs(1);
/// How long the SSH child gets before the early-exit check.
const SSH_STARTUP_DELAY: Duration = Duration::from_secs(3);
/// Combined probe rounds after spawn, and their spacing.
const STARTUP_PROBE_ROUNDS: u32 = 3;
const STARTUP_PROBE_DELAY: Duration = Duration::from_secs(2);
/// Grace window between SIGTERM and SIGKILL on stop.
const CHILD_STOP_GRACE: Duration = Duration::from_secs(5);
/// Budget for draining the dead child's stderr.
const STDERR_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Stopped,
    Starting,
    Running,
    Unhealthy,
    Recovering,
    Failed,
}

impl TunnelStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, TunnelStatus::Running)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TunnelStatus::Failed)
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelStatus::Stopped => "Stopped",
            TunnelStatus::Starting => "Starting",
            TunnelStatus::Running => "Running",
            TunnelStatus::Unhealthy => "Unhealthy",
            TunnelStatus::Recovering => "Recovering",
            TunnelStatus::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}

/// Read-only copy of one supervisor's state.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelSnapshot {
    pub remote_port: u16,
    pub status: TunnelStatus,
    pub local_socks_port: Option<u16>,
    pub engine: EngineSnapshot,
    #[serde(skip)]
    pub uptime: Option<Duration>,
    pub failure_count: u32,
    pub last_error: Option<String>,
}

/// Orchestrator for one endpoint's engine and SSH child.
pub struct TunnelSupervisor {
    endpoint: Endpoint,
    engine: Socks5Server,
    ssh: SshClient,
    probe: HealthProbe,
    pid_file: PidFile,
    recovery_delay: Duration,

    status: Mutex<TunnelStatus>,
    child: tokio::sync::Mutex<Option<Child>>,
    start_time: Mutex<Option<Instant>>,
    failure_count: AtomicU32,
    last_error: Mutex<Option<String>>,
    /// Serializes create/stop/recover for this supervisor.
    op_lock: tokio::sync::Mutex<()>,
}

impl TunnelSupervisor {
    pub fn new(endpoint: Endpoint, config: &FleetConfig) -> Self {
        let credentials = match (&config.socks_username, &config.socks_password) {
            (Some(user), Some(pass)) => Some(Credentials::new(user, pass)),
            _ => None,
        };
        let engine = Socks5Server::new(EngineConfig {
            host: "127.0.0.1".to_string(),
            port: endpoint.local_socks_port,
            auth_required: config.socks_auth_required,
            credentials,
            max_connections: config.max_connections,
            buffer_size: config.buffer_size,
        });
        let probe = HealthProbe::new(
            "127.0.0.1",
            endpoint.local_socks_port,
            endpoint.canary_host.clone(),
            endpoint.canary_port,
        );
        let ssh = SshClient::for_endpoint(&endpoint);
        let pid_file = PidFile::new(&config.pid_dir, endpoint.remote_port);

        Self {
            endpoint,
            engine,
            ssh,
            probe,
            pid_file,
            recovery_delay: config.recovery_delay(),
            status: Mutex::new(TunnelStatus::Stopped),
            child: tokio::sync::Mutex::new(None),
            start_time: Mutex::new(None),
            failure_count: AtomicU32::new(0),
            last_error: Mutex::new(None),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn remote_port(&self) -> u16 {
        self.endpoint.remote_port
    }

    pub fn local_socks_port(&self) -> u16 {
        self.endpoint.local_socks_port
    }

    pub fn status(&self) -> TunnelStatus {
        *self.status.lock().unwrap()
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    /// Start the engine and the SSH child.
    pub async fn create(&self) -> Result<(), SupervisorError> {
        let _guard = self.op_lock.lock().await;
        self.create_locked().await
    }

    /// Stop the SSH child and the engine, removing the PID file. Idempotent.
    pub async fn stop(&self) {
        let _guard = self.op_lock.lock().await;
        self.stop_locked().await;
    }

    /// Stop, wait out the recovery delay, then create again.
    pub async fn recover(&self) -> Result<(), SupervisorError> {
        let _guard = self.op_lock.lock().await;
        info!(port = self.endpoint.remote_port, "starting recovery");
        self.set_status(TunnelStatus::Recovering);

        self.stop_locked().await;
        tokio::time::sleep(self.recovery_delay).await;

        let result = self.create_locked().await;
        match &result {
            Ok(()) => info!(port = self.endpoint.remote_port, "recovery successful"),
            Err(err) => warn!(
                port = self.endpoint.remote_port,
                error = %err,
                "recovery failed"
            ),
        }
        result
    }

    async fn create_locked(&self) -> Result<(), SupervisorError> {
        if self.child.lock().await.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }
        self.set_status(TunnelStatus::Starting);

        // Engine first: the remote forward needs something to point at.
        if let Err(err) = self.engine.start().await {
            self.fail(format!("engine start failed: {}", err));
            return Err(SupervisorError::Engine(err));
        }

        tokio::time::sleep(ENGINE_SETTLE_DELAY).await;
        let report = self.probe.run().await;
        if !report.overall_healthy() {
            self.engine.stop().await;
            self.fail("local SOCKS5 probe failed after start".to_string());
            return Err(SupervisorError::EngineUnhealthy);
        }
        debug!(
            port = self.endpoint.remote_port,
            socks_port = self.endpoint.local_socks_port,
            "engine started and verified"
        );

        let mut child = self
            .ssh
            .spawn_reverse_tunnel(self.endpoint.remote_port, self.endpoint.local_socks_port)
            .map_err(|err| {
                self.fail(format!("failed to spawn ssh: {}", err));
                SupervisorError::SpawnFailed(err)
            })?;

        if let Some(pid) = child.id() {
            if let Err(err) = self.pid_file.write(pid).await {
                warn!(
                    port = self.endpoint.remote_port,
                    error = %err,
                    "could not write PID file"
                );
            }
        }

        tokio::time::sleep(SSH_STARTUP_DELAY).await;

        if let Ok(Some(exit)) = child.try_wait() {
            let stderr = read_stderr(&mut child).await;
            let message = if stderr.is_empty() {
                format!("ssh exited immediately ({})", exit)
            } else {
                format!("ssh exited immediately ({}): {}", exit, stderr)
            };
            self.fail(message.clone());
            return Err(SupervisorError::SshExited { message });
        }

        *self.child.lock().await = Some(child);

        for round in 1..=STARTUP_PROBE_ROUNDS {
            let ssh_ok = self.probe_ssh().await;
            let socks_ok = self.probe_socks().await;
            if ssh_ok && socks_ok {
                self.set_status(TunnelStatus::Running);
                self.failure_count.store(0, Ordering::Relaxed);
                *self.last_error.lock().unwrap() = None;
                *self.start_time.lock().unwrap() = Some(Instant::now());
                info!(
                    port = self.endpoint.remote_port,
                    socks_port = self.endpoint.local_socks_port,
                    "tunnel and SOCKS5 engine are running"
                );
                return Ok(());
            }
            debug!(
                port = self.endpoint.remote_port,
                round,
                ssh_ok,
                socks_ok,
                "startup probe round failed"
            );
            if round < STARTUP_PROBE_ROUNDS {
                tokio::time::sleep(STARTUP_PROBE_DELAY).await;
            }
        }

        self.set_status(TunnelStatus::Unhealthy);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().unwrap() =
            Some("tunnel created but health checks failed".to_string());
        Err(SupervisorError::ProbesFailed)
    }

    async fn stop_locked(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            terminate_child(&mut child, self.endpoint.remote_port).await;
        }
        self.engine.stop().await;
        self.pid_file.remove().await;

        self.set_status(TunnelStatus::Stopped);
        *self.start_time.lock().unwrap() = None;
        debug!(port = self.endpoint.remote_port, "supervisor stopped");
    }

    /// SSH half health: child alive and the remote listener reachable.
    pub async fn probe_ssh(&self) -> bool {
        {
            let mut child = self.child.lock().await;
            match child.as_mut() {
                None => return false,
                Some(child) => {
                    if !matches!(child.try_wait(), Ok(None)) {
                        return false;
                    }
                }
            }
        }
        self.ssh.probe_remote_port(self.endpoint.remote_port).await
    }

    /// SOCKS5 half health: the staged local probe.
    pub async fn probe_socks(&self) -> bool {
        self.probe.run().await.overall_healthy()
    }

    /// Fold one probe round into supervisor state (the monitor's tick).
    ///
    /// Both healthy: `Running`, failure count decays by one. SSH unhealthy
    /// alone: `Unhealthy`. SOCKS5 unhealthy alone: supervisor stays
    /// `Running` with the engine marked unhealthy. Both unhealthy:
    /// `Failed`. Every unhealthy round counts one failure.
    pub fn apply_probe_outcome(&self, ssh_ok: bool, socks_ok: bool) -> TunnelStatus {
        let new_status = if ssh_ok && socks_ok {
            self.engine.mark_healthy();
            let _ = self
                .failure_count
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                    Some(count.saturating_sub(1))
                });
            TunnelStatus::Running
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
            match (ssh_ok, socks_ok) {
                (false, false) => {
                    self.engine.mark_unhealthy();
                    TunnelStatus::Failed
                }
                (false, true) => {
                    self.engine.mark_healthy();
                    TunnelStatus::Unhealthy
                }
                _ => {
                    self.engine.mark_unhealthy();
                    TunnelStatus::Running
                }
            }
        };
        self.set_status(new_status);
        new_status
    }

    /// Read-only state copy for the status view.
    pub fn snapshot(&self) -> TunnelSnapshot {
        let status = self.status();
        TunnelSnapshot {
            remote_port: self.endpoint.remote_port,
            status,
            local_socks_port: self.engine.local_addr().map(|addr| addr.port()),
            engine: self.engine.snapshot(),
            uptime: self
                .start_time
                .lock()
                .unwrap()
                .map(|started| started.elapsed()),
            failure_count: self.failure_count(),
            last_error: self.last_error(),
        }
    }

    fn set_status(&self, status: TunnelStatus) {
        *self.status.lock().unwrap() = status;
    }

    fn fail(&self, message: String) {
        warn!(port = self.endpoint.remote_port, error = %message, "tunnel failed");
        *self.last_error.lock().unwrap() = Some(message);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.set_status(TunnelStatus::Failed);
    }
}

/// SIGTERM, a grace window, then SIGKILL.
async fn terminate_child(child: &mut Child, port: u16) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };

    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGTERM,
    );

    match timeout(CHILD_STOP_GRACE, child.wait()).await {
        Ok(_) => debug!(port, pid, "ssh child exited after SIGTERM"),
        Err(_) => {
            warn!(port, pid, "ssh child ignored SIGTERM, killing");
            let _ = child.kill().await;
        }
    }
}

/// Drain stderr from a child that already exited.
async fn read_stderr(child: &mut Child) -> String {
    let Some(mut stderr) = child.stderr.take() else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = timeout(STDERR_READ_TIMEOUT, stderr.read_to_end(&mut buf)).await;
    String::from_utf8_lossy(&buf).trim().to_string()
}

/// Supervisor-level failure.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("tunnel is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Engine(#[from] portway_socks::EngineError),

    #[error("engine started but failed its local probe")]
    EngineUnhealthy,

    #[error("failed to spawn ssh child: {0}")]
    SpawnFailed(std::io::Error),

    #[error("{message}")]
    SshExited { message: String },

    #[error("tunnel created but health checks failed")]
    ProbesFailed,
}
