//! Read-only status view over the fleet.
//!
//! A pure function of the fleet snapshot; nothing here mutates supervisor
//! state. Rendering is plain text, one aligned row per endpoint.

use crate::supervisor::{TunnelSnapshot, TunnelStatus};
use portway_socks::EngineStatus;
use serde::Serialize;
use std::time::Duration;

/// One endpoint's line in the status display.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatusRow {
    pub remote_port: u16,
    pub ssh_status: TunnelStatus,
    pub local_socks_port: Option<u16>,
    pub socks_status: EngineStatus,
    /// Floor-formatted `HH:MM`
    pub uptime: String,
    pub failure_count: u32,
    pub last_error: Option<String>,
}

impl From<&TunnelSnapshot> for EndpointStatusRow {
    fn from(snapshot: &TunnelSnapshot) -> Self {
        Self {
            remote_port: snapshot.remote_port,
            ssh_status: snapshot.status,
            local_socks_port: snapshot.local_socks_port,
            socks_status: snapshot.engine.status,
            uptime: format_uptime(snapshot.uptime),
            failure_count: snapshot.failure_count,
            last_error: snapshot.last_error.clone(),
        }
    }
}

/// Build the display rows from a fleet snapshot.
pub fn status_rows(snapshots: &[TunnelSnapshot]) -> Vec<EndpointStatusRow> {
    snapshots.iter().map(EndpointStatusRow::from).collect()
}

/// Floor-format an uptime as `HH:MM`.
pub fn format_uptime(uptime: Option<Duration>) -> String {
    let Some(uptime) = uptime else {
        return "00:00".to_string();
    };
    let total_minutes = uptime.as_secs() / 60;
    format!("{:02}:{:02}", total_minutes / 60, total_minutes % 60)
}

/// Render the rows as an aligned text table.
pub fn render_table(rows: &[EndpointStatusRow]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<8} {:<11} {:<12} {:<13} {:<7} {:<9} {}\n",
        "Tunnel", "SSH Status", "SOCKS5 Port", "SOCKS5 Status", "Uptime", "Failures", "Last Error"
    ));
    for row in rows {
        let socks_port = row
            .local_socks_port
            .map(|port| port.to_string())
            .unwrap_or_else(|| "-".to_string());
        let mut error = row.last_error.clone().unwrap_or_default();
        if error.len() > 40 {
            error.truncate(37);
            error.push_str("...");
        }
        out.push_str(&format!(
            "{:<8} {:<11} {:<12} {:<13} {:<7} {:<9} {}\n",
            row.remote_port,
            row.ssh_status.to_string(),
            socks_port,
            row.socks_status.to_string(),
            row.uptime,
            row.failure_count,
            error
        ));
    }
    out
}
