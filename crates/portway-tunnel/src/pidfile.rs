//! PID-file bookkeeping for SSH children.
//!
//! One `tunnel_<remote_port>.pid` file per supervisor, holding the child
//! PID as decimal ASCII. Created on start (stale files are overwritten),
//! removed on stop.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::debug;

/// The PID file of one tunnel endpoint.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(dir: &Path, remote_port: u16) -> Self {
        Self {
            path: dir.join(format!("tunnel_{}.pid", remote_port)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the PID, creating the directory and overwriting any stale file.
    pub async fn write(&self, pid: u32) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, pid.to_string()).await
    }

    pub async fn read(&self) -> Option<u32> {
        fs::read_to_string(&self.path)
            .await
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Remove the file. Missing files are not an error.
    pub async fn remove(&self) {
        if fs::remove_file(&self.path).await.is_ok() {
            debug!(path = %self.path.display(), "removed PID file");
        }
    }
}

/// True iff a process with this PID exists.
pub fn pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

/// Terminate a process by PID: SIGTERM, a grace window, then SIGKILL.
///
/// Used against the SSH children of a previous run, which are not our
/// children and so are reaped by init once they exit. Returns true when
/// the process is gone.
pub async fn terminate_pid(pid: u32, grace: Duration) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let target = Pid::from_raw(pid as i32);
    if kill(target, Signal::SIGTERM).is_err() {
        return true;
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let _ = kill(target, Signal::SIGKILL);
    tokio::time::sleep(Duration::from_millis(100)).await;
    !pid_alive(pid)
}

/// Enumerate the PID files of a previous run, keyed by remote port.
pub async fn scan_dir(dir: &Path) -> Vec<(u16, PidFile)> {
    let mut found = Vec::new();
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return found;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(port) = name
            .strip_prefix("tunnel_")
            .and_then(|rest| rest.strip_suffix(".pid"))
            .and_then(|port| port.parse().ok())
        else {
            continue;
        };
        found.push((port, PidFile::new(dir, port)));
    }
    found.sort_by_key(|(port, _)| *port);
    found
}
