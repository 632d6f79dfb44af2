//! Portway tunnel supervision.
//!
//! Pairs every local SOCKS5 engine with an SSH reverse tunnel that exposes
//! it on a remote host, and keeps both halves alive.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                          Fleet                             │
//! │                                                            │
//! │  FleetMonitor ──probes──▶ TunnelSupervisor (per endpoint)  │
//! │                             │            │                 │
//! │                             ▼            ▼                 │
//! │                       Socks5Server   ssh -N -R child       │
//! │                       (127.0.0.1:p)  (remote:q → local:p)  │
//! └────────────────────────────────────────────────────────────┘
//!
//! Client ──▶ remote_host:q ──SSH reverse tunnel──▶ 127.0.0.1:p ──▶ Internet
//! ```
//!
//! The monitor probes each supervisor's SSH half (child alive plus a remote
//! `/dev/tcp` check) and SOCKS5 half (staged local probe); a supervisor
//! whose failure count crosses the threshold is stopped, delayed, and
//! re-created.

mod endpoint;
mod fleet;
mod monitor;
mod pidfile;
mod ssh;
mod status;
mod supervisor;

pub use endpoint::{ConfigError, Endpoint, FleetConfig, MIN_PORT};
pub use fleet::{Fleet, FleetError};
pub use monitor::FleetMonitor;
pub use pidfile::{pid_alive, scan_dir, terminate_pid, PidFile};
pub use ssh::{SshAuth, SshClient};
pub use status::{format_uptime, render_table, status_rows, EndpointStatusRow};
pub use supervisor::{SupervisorError, TunnelSnapshot, TunnelStatus, TunnelSupervisor};
