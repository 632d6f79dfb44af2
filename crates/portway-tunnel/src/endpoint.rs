//! Endpoint and fleet configuration.
//!
//! An [`Endpoint`] is the immutable description of one tunnel: the port the
//! remote host exposes, the derived local SOCKS5 port, and the SSH identity
//! used to reach the remote. [`FleetConfig`] holds the knobs shared by every
//! endpoint and derives endpoints from remote-port lists.

use crate::ssh::SshAuth;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Lowest port accepted from configuration.
pub const MIN_PORT: u16 = 1024;

/// Immutable configuration for one tunnel endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Port the remote listener exposes
    pub remote_port: u16,
    /// Derived local SOCKS5 port
    pub local_socks_port: u16,
    pub remote_host: String,
    pub ssh_port: u16,
    pub remote_user: String,
    pub auth: SshAuth,
    /// Target the full-connection probe dials through the proxy
    pub canary_host: String,
    pub canary_port: u16,
}

/// Shared fleet configuration.
///
/// All fields have defaults matching the managed deployment, so a config
/// file only needs to override what differs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FleetConfig {
    pub remote_host: String,
    pub remote_user: String,
    pub ssh_port: u16,
    /// Password for SSH; key authentication is preferred when it works
    pub password: Option<String>,

    /// First remote port of the dense assignment
    pub base_remote_port: u16,
    /// First local SOCKS5 port; locals are `base + (remote - base_remote)`
    pub socks_base_port: u16,

    pub socks_auth_required: bool,
    pub socks_username: Option<String>,
    pub socks_password: Option<String>,
    pub max_connections: usize,
    pub buffer_size: usize,

    pub canary_host: String,
    pub canary_port: u16,

    /// Seconds between fleet monitor ticks
    pub health_check_interval: u64,
    /// Probe failures before recovery kicks in
    pub max_failure_count: u32,
    /// Seconds to wait between stop and re-create during recovery
    pub recovery_delay: u64,

    pub pid_dir: PathBuf,
    pub log_file: PathBuf,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            remote_host: String::new(),
            remote_user: "root".to_string(),
            ssh_port: 22,
            password: None,
            base_remote_port: 1080,
            socks_base_port: 8880,
            socks_auth_required: false,
            socks_username: None,
            socks_password: None,
            max_connections: 50,
            buffer_size: 8192,
            canary_host: "www.google.com".to_string(),
            canary_port: 80,
            health_check_interval: 30,
            max_failure_count: 5,
            recovery_delay: 10,
            pid_dir: PathBuf::from("/var/run/ssh_socks5_manager"),
            log_file: PathBuf::from("/var/log/ssh_socks5_manager.log"),
        }
    }
}

impl FleetConfig {
    /// Parse a TOML config file.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_secs(self.recovery_delay)
    }

    /// Validate the config that must be present before any tunnel starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote_host.is_empty() {
            return Err(ConfigError::MissingRemoteHost);
        }
        if self.socks_auth_required && (self.socks_username.is_none() || self.socks_password.is_none())
        {
            return Err(ConfigError::MissingCredentials);
        }
        Ok(())
    }

    /// Derive the endpoint for one remote port.
    pub fn endpoint(&self, remote_port: u16, auth: SshAuth) -> Result<Endpoint, ConfigError> {
        if !(MIN_PORT..=u16::MAX).contains(&remote_port) {
            return Err(ConfigError::PortOutOfRange(remote_port));
        }
        let offset = remote_port
            .checked_sub(self.base_remote_port)
            .ok_or(ConfigError::PortBelowBase {
                port: remote_port,
                base: self.base_remote_port,
            })?;
        let local_socks_port = self
            .socks_base_port
            .checked_add(offset)
            .ok_or(ConfigError::LocalPortOverflow { port: remote_port })?;

        Ok(Endpoint {
            remote_port,
            local_socks_port,
            remote_host: self.remote_host.clone(),
            ssh_port: self.ssh_port,
            remote_user: self.remote_user.clone(),
            auth,
            canary_host: self.canary_host.clone(),
            canary_port: self.canary_port,
        })
    }

    /// Derive endpoints for a port list, rejecting duplicates and any
    /// derived local port that would collide.
    pub fn endpoints(
        &self,
        remote_ports: &[u16],
        auth: SshAuth,
    ) -> Result<Vec<Endpoint>, ConfigError> {
        self.validate()?;

        let mut endpoints = Vec::with_capacity(remote_ports.len());
        for &port in remote_ports {
            let endpoint = self.endpoint(port, auth.clone())?;
            if endpoints
                .iter()
                .any(|existing: &Endpoint| existing.remote_port == endpoint.remote_port)
            {
                return Err(ConfigError::DuplicatePort(port));
            }
            if endpoints
                .iter()
                .any(|existing: &Endpoint| existing.local_socks_port == endpoint.local_socks_port)
            {
                return Err(ConfigError::PortCollision {
                    port,
                    local: endpoint.local_socks_port,
                });
            }
            endpoints.push(endpoint);
        }
        Ok(endpoints)
    }
}

/// Configuration rejection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("remote host is not configured")]
    MissingRemoteHost,

    #[error("SOCKS5 authentication enabled without credentials")]
    MissingCredentials,

    #[error("port {0} outside the allowed range {MIN_PORT}-65535")]
    PortOutOfRange(u16),

    #[error("port {port} is below the base remote port {base}")]
    PortBelowBase { port: u16, base: u16 },

    #[error("port {port}: derived local SOCKS5 port overflows")]
    LocalPortOverflow { port: u16 },

    #[error("port {0} listed twice")]
    DuplicatePort(u16),

    #[error("port {port}: derived local SOCKS5 port {local} collides with another endpoint")]
    PortCollision { port: u16, local: u16 },

    #[error("config parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FleetConfig {
        FleetConfig {
            remote_host: "203.0.113.9".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_local_port_derivation() {
        let ep = config().endpoint(1082, SshAuth::Key).unwrap();
        assert_eq!(ep.local_socks_port, 8882);
        assert_eq!(ep.remote_port, 1082);
    }

    #[test]
    fn test_port_range_enforced() {
        assert!(matches!(
            config().endpoint(1023, SshAuth::Key),
            Err(ConfigError::PortOutOfRange(1023))
        ));
    }

    #[test]
    fn test_port_below_base_rejected() {
        let cfg = FleetConfig {
            base_remote_port: 2000,
            ..config()
        };
        assert!(matches!(
            cfg.endpoint(1500, SshAuth::Key),
            Err(ConfigError::PortBelowBase { .. })
        ));
    }

    #[test]
    fn test_local_ports_pairwise_distinct() {
        let eps = config()
            .endpoints(&[1080, 1081, 1082], SshAuth::Key)
            .unwrap();
        let mut locals: Vec<u16> = eps.iter().map(|e| e.local_socks_port).collect();
        locals.sort_unstable();
        locals.dedup();
        assert_eq!(locals.len(), 3);
    }

    #[test]
    fn test_duplicate_port_rejected() {
        assert!(matches!(
            config().endpoints(&[1080, 1080], SshAuth::Key),
            Err(ConfigError::DuplicatePort(1080))
        ));
    }

    #[test]
    fn test_missing_host_rejected() {
        let cfg = FleetConfig::default();
        assert!(matches!(
            cfg.endpoints(&[1080], SshAuth::Key),
            Err(ConfigError::MissingRemoteHost)
        ));
    }

    #[test]
    fn test_auth_requires_credentials() {
        let cfg = FleetConfig {
            socks_auth_required: true,
            ..config()
        };
        assert!(matches!(
            cfg.endpoints(&[1080], SshAuth::Key),
            Err(ConfigError::MissingCredentials)
        ));
    }

    #[test]
    fn test_toml_overrides() {
        let cfg = FleetConfig::from_toml(
            r#"
            remote_host = "198.51.100.4"
            remote_user = "tunnel"
            health_check_interval = 10
            "#,
        )
        .unwrap();
        assert_eq!(cfg.remote_host, "198.51.100.4");
        assert_eq!(cfg.remote_user, "tunnel");
        assert_eq!(cfg.health_check_interval(), Duration::from_secs(10));
        // Untouched fields keep their defaults.
        assert_eq!(cfg.ssh_port, 22);
        assert_eq!(cfg.socks_base_port, 8880);
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        assert!(FleetConfig::from_toml("remot_host = \"x\"").is_err());
    }
}
