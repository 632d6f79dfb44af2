//! Portway: SOCKS5 proxies served through supervised SSH reverse tunnels.
//!
//! Main entry point. Parses the command line, assembles the fleet
//! configuration, sets up logging, and drives the fleet through its
//! lifecycle: start, monitor, and graceful teardown on SIGINT/SIGTERM.

mod cli;
mod logging;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, CliCommand, ConnectionArg};
use portway_tunnel::{
    pid_alive, render_table, scan_dir, status_rows, terminate_pid, Fleet, FleetConfig,
    FleetMonitor,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// Use mimalloc as the global allocator for relay throughput
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Grace window when terminating the SSH children of a previous run.
const STOP_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let (connection, args) = cli::split_connection_arg(std::env::args().collect());
    let cli = Cli::parse_from(args);

    let config = load_config(cli.config.as_deref(), connection)?;
    logging::init(&config.log_file);

    match cli.command.unwrap_or(CliCommand::Start {
        ports: Vec::new(),
        force: false,
    }) {
        CliCommand::Start { ports, force } => run_fleet(config, &ports, force).await,
        CliCommand::Monitor { ports } => run_fleet(config, &ports, false).await,
        CliCommand::Restart { ports, force } => {
            stop_previous(&config).await?;
            run_fleet(config, &ports, force).await
        }
        CliCommand::Stop => stop_previous(&config).await,
        CliCommand::Status { json } => show_status(&config, json).await,
        CliCommand::Test => run_connectivity_test(config).await,
    }
}

/// Assemble the fleet configuration from file and command line.
fn load_config(path: Option<&Path>, connection: Option<ConnectionArg>) -> Result<FleetConfig> {
    let mut config = match path {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read config file {}", path.display()))?;
            FleetConfig::from_toml(&contents)
                .with_context(|| format!("invalid config file {}", path.display()))?
        }
        None => FleetConfig::default(),
    };

    if let Some(connection) = connection {
        config.remote_host = connection.host;
        config.password = Some(connection.password);
    }
    Ok(config)
}

/// Start the tunnels and monitor them until a shutdown signal arrives.
async fn run_fleet(config: FleetConfig, ports: &[u16], force: bool) -> Result<()> {
    let ports = cli::effective_ports(ports);
    config.validate().context("configuration error")?;

    if force {
        clean_stale_state(&config).await;
    }

    info!(ports = ?ports, host = %config.remote_host, "starting tunnels");
    let fleet = Arc::new(Fleet::new(config));
    let started = fleet
        .start_endpoints(&ports)
        .await
        .context("fatal startup failure")?;
    if started == 0 {
        bail!("no tunnels came up");
    }

    print_connection_info(&fleet, &ports);
    print!("{}", render_table(&status_rows(&fleet.snapshot())));

    // Monitor runs until the shutdown signal cancels it.
    let monitor_cancel = CancellationToken::new();
    let mut monitor_task =
        tokio::spawn(FleetMonitor::new(fleet.clone()).run(monitor_cancel.clone()));

    wait_for_shutdown().await?;
    info!("shutdown signal received, draining");

    // Teardown order: monitor first, then every supervisor concurrently.
    fleet.begin_drain();
    monitor_cancel.cancel();
    if tokio::time::timeout(Duration::from_secs(5), &mut monitor_task)
        .await
        .is_err()
    {
        // Mid-recovery tick; don't let it hold up the drain.
        monitor_task.abort();
    }
    fleet.stop_all().await;

    info!("all tunnels stopped");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("cannot install signal handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("cannot listen for ctrl-c")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

/// Terminate SSH children recorded by a previous run and clear their files.
async fn stop_previous(config: &FleetConfig) -> Result<()> {
    let found = scan_dir(&config.pid_dir).await;
    if found.is_empty() {
        println!("no tunnels found in {}", config.pid_dir.display());
        return Ok(());
    }

    for (port, pid_file) in found {
        match pid_file.read().await {
            Some(pid) if pid_alive(pid) => {
                if terminate_pid(pid, STOP_GRACE).await {
                    info!(port, pid, "tunnel stopped");
                    println!("stopped tunnel {} (pid {})", port, pid);
                } else {
                    warn!(port, pid, "tunnel process would not die");
                    println!("tunnel {} (pid {}) would not die", port, pid);
                }
            }
            Some(pid) => println!("tunnel {} (pid {}) was already gone", port, pid),
            None => println!("tunnel {}: unreadable PID file", port),
        }
        pid_file.remove().await;
    }
    Ok(())
}

/// Kill leftovers without asking (the `--force` path).
async fn clean_stale_state(config: &FleetConfig) {
    for (port, pid_file) in scan_dir(&config.pid_dir).await {
        if let Some(pid) = pid_file.read().await {
            if pid_alive(pid) {
                warn!(port, pid, "killing stale tunnel from a previous run");
                terminate_pid(pid, STOP_GRACE).await;
            }
        }
        pid_file.remove().await;
    }
}

/// Report the state left behind by a previous run.
async fn show_status(config: &FleetConfig, json: bool) -> Result<()> {
    let found = scan_dir(&config.pid_dir).await;

    if json {
        let mut entries = Vec::new();
        for (port, pid_file) in found {
            let pid = pid_file.read().await;
            entries.push(serde_json::json!({
                "remote_port": port,
                "pid": pid,
                "alive": pid.map(pid_alive).unwrap_or(false),
            }));
        }
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if found.is_empty() {
        println!("no tunnels found in {}", config.pid_dir.display());
        return Ok(());
    }
    println!("{:<8} {:<8} {}", "Tunnel", "PID", "Alive");
    for (port, pid_file) in found {
        match pid_file.read().await {
            Some(pid) => println!("{:<8} {:<8} {}", port, pid, pid_alive(pid)),
            None => println!("{:<8} {:<8} {}", port, "-", false),
        }
    }
    Ok(())
}

/// The `test` command: validate SSH connectivity and report.
async fn run_connectivity_test(config: FleetConfig) -> Result<()> {
    config.validate().context("configuration error")?;
    println!("testing SSH connectivity to {}...", config.remote_host);

    let fleet = Fleet::new(config);
    if fleet.validate_connectivity().await {
        println!("SSH connectivity: OK");
        Ok(())
    } else {
        bail!("SSH connectivity: failed");
    }
}

/// Plain-text summary printed after a successful start.
fn print_connection_info(fleet: &Arc<Fleet>, ports: &[u16]) {
    let config = fleet.config();
    let locals: Vec<String> = fleet
        .supervisors()
        .iter()
        .map(|s| s.local_socks_port().to_string())
        .collect();
    let remotes: Vec<String> = ports.iter().map(|p| p.to_string()).collect();

    println!();
    println!("SSH tunnels with SOCKS5 proxies are up.");
    println!("  remote server:      {}:{}", config.remote_host, config.ssh_port);
    println!("  remote SOCKS5 ports: {}", remotes.join(" "));
    println!("  local SOCKS5 ports:  {}", locals.join(" "));
    println!(
        "  authentication:      {}",
        if config.socks_auth_required {
            "username/password"
        } else {
            "none"
        }
    );
    println!();
    println!("clients reach {}:<port> and receive SOCKS5 service from this machine.", config.remote_host);
    println!();
}
