//! The fleet: every tunnel supervisor, keyed by remote port.
//!
//! The fleet owns its supervisors and the draining flag. The monitor and
//! the status view only ever borrow supervisors from here; starting new
//! endpoints while draining is rejected.

use crate::endpoint::{ConfigError, FleetConfig};
use crate::ssh::{SshAuth, SshClient};
use crate::supervisor::{TunnelSnapshot, TunnelSupervisor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// Total budget for stopping every supervisor on shutdown.
const STOP_ALL_BUDGET: Duration = Duration::from_secs(10);

/// Process-wide collection of tunnel supervisors.
pub struct Fleet {
    config: Arc<FleetConfig>,
    supervisors: Mutex<HashMap<u16, Arc<TunnelSupervisor>>>,
    /// Resolved once, before the first endpoint starts
    auth: Mutex<Option<SshAuth>>,
    draining: AtomicBool,
}

impl Fleet {
    pub fn new(config: FleetConfig) -> Self {
        Self {
            config: Arc::new(config),
            supervisors: Mutex::new(HashMap::new()),
            auth: Mutex::new(None),
            draining: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    /// Enter the draining state; new work is rejected from here on.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    /// Decide between key and password authentication, once.
    pub async fn resolve_auth(&self) -> SshAuth {
        if let Some(auth) = self.auth.lock().unwrap().clone() {
            return auth;
        }

        let auth = match &self.config.password {
            Some(password) => {
                let key_client = SshClient::new(
                    self.config.remote_host.clone(),
                    self.config.ssh_port,
                    self.config.remote_user.clone(),
                    SshAuth::Key,
                );
                if key_client.detect_key_auth().await {
                    info!("using SSH key authentication");
                    SshAuth::Key
                } else {
                    info!("using password authentication");
                    SshAuth::Password(password.clone())
                }
            }
            None => SshAuth::Key,
        };

        *self.auth.lock().unwrap() = Some(auth.clone());
        auth
    }

    /// Check that the remote host answers at all.
    pub async fn validate_connectivity(&self) -> bool {
        let auth = self.resolve_auth().await;
        SshClient::new(
            self.config.remote_host.clone(),
            self.config.ssh_port,
            self.config.remote_user.clone(),
            auth,
        )
        .check_connectivity()
        .await
    }

    /// Start supervisors for a list of remote ports.
    ///
    /// The port list is validated as a whole (range, duplicates, local-port
    /// collisions) and SSH connectivity is checked once before any tunnel
    /// starts. Individual create failures leave the supervisor registered
    /// in `Failed`/`Unhealthy` state for the monitor to recover; the return
    /// value counts the endpoints that came up immediately.
    pub async fn start_endpoints(&self, remote_ports: &[u16]) -> Result<usize, FleetError> {
        if self.is_draining() {
            return Err(FleetError::Draining);
        }

        let auth = self.resolve_auth().await;
        let endpoints = self.config.endpoints(remote_ports, auth)?;

        if !self.validate_connectivity().await {
            return Err(FleetError::SshUnreachable {
                host: self.config.remote_host.clone(),
            });
        }

        let mut started = 0;
        for endpoint in endpoints {
            if self.is_draining() {
                return Err(FleetError::Draining);
            }
            let port = endpoint.remote_port;
            if self.get(port).is_some() {
                warn!(port, "endpoint already registered, skipping");
                continue;
            }

            let supervisor = Arc::new(TunnelSupervisor::new(endpoint, &self.config));
            self.insert(supervisor.clone());
            match supervisor.create().await {
                Ok(()) => started += 1,
                Err(err) => {
                    // Left registered; the monitor will keep trying.
                    warn!(port, error = %err, "endpoint failed to start");
                }
            }
        }
        Ok(started)
    }

    /// Stop every supervisor concurrently within the shutdown budget.
    pub async fn stop_all(&self) {
        let supervisors: Vec<Arc<TunnelSupervisor>> = {
            let mut map = self.supervisors.lock().unwrap();
            map.drain().map(|(_, supervisor)| supervisor).collect()
        };
        if supervisors.is_empty() {
            return;
        }

        info!(count = supervisors.len(), "stopping all tunnels");
        let handles: Vec<_> = supervisors
            .into_iter()
            .map(|supervisor| tokio::spawn(async move { supervisor.stop().await }))
            .collect();
        let drain_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if timeout(STOP_ALL_BUDGET, drain_all).await.is_err() {
            warn!("fleet stop exceeded its budget");
        }
    }

    /// Supervisors ordered by remote port.
    pub fn supervisors(&self) -> Vec<Arc<TunnelSupervisor>> {
        let mut supervisors: Vec<_> = self
            .supervisors
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        supervisors.sort_by_key(|supervisor| supervisor.remote_port());
        supervisors
    }

    pub fn get(&self, remote_port: u16) -> Option<Arc<TunnelSupervisor>> {
        self.supervisors.lock().unwrap().get(&remote_port).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.supervisors.lock().unwrap().is_empty()
    }

    /// Read-only state of every supervisor, ordered by remote port.
    pub fn snapshot(&self) -> Vec<TunnelSnapshot> {
        self.supervisors()
            .iter()
            .map(|supervisor| supervisor.snapshot())
            .collect()
    }

    fn insert(&self, supervisor: Arc<TunnelSupervisor>) {
        self.supervisors
            .lock()
            .unwrap()
            .insert(supervisor.remote_port(), supervisor);
    }
}

/// Fleet-level failure.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("shutting down, new work rejected")]
    Draining,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("SSH host {host} is unreachable")]
    SshUnreachable { host: String },
}
