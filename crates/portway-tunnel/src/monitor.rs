//! Fleet monitor: periodic probing and autonomous recovery.
//!
//! One background task for the whole fleet. Each tick probes every
//! supervisor's SSH and SOCKS5 halves, folds the results into supervisor
//! state, and recovers any supervisor whose failure count crossed the
//! threshold. While the fleet is unhealthy the tick interval backs off
//! exponentially, capped at five doublings and 300 seconds.

use crate::fleet::Fleet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const BACKOFF_CAP: Duration = Duration::from_secs(300);
const BACKOFF_MAX_EXPONENT: u32 = 5;
/// Pause after an internal monitor failure before continuing.
const ERROR_PAUSE: Duration = Duration::from_secs(10);

/// The fleet's single monitoring loop.
pub struct FleetMonitor {
    fleet: Arc<Fleet>,
    interval: Duration,
    max_failure_count: u32,
    consecutive_failed_ticks: u32,
}

impl FleetMonitor {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        let interval = fleet.config().health_check_interval();
        let max_failure_count = fleet.config().max_failure_count;
        Self {
            fleet,
            interval,
            max_failure_count,
            consecutive_failed_ticks: 0,
        }
    }

    /// Run until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(interval = ?self.interval, "fleet monitoring started");
        loop {
            let sleep_for = self.tick().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        info!("fleet monitoring stopped");
    }

    /// Probe every supervisor, trigger recoveries, return the next sleep.
    async fn tick(&mut self) -> Duration {
        let supervisors = self.fleet.supervisors();
        let total = supervisors.len();
        let mut healthy = 0usize;
        let mut to_recover = Vec::new();

        for supervisor in &supervisors {
            let ssh_ok = supervisor.probe_ssh().await;
            let socks_ok = supervisor.probe_socks().await;
            supervisor.apply_probe_outcome(ssh_ok, socks_ok);

            if ssh_ok && socks_ok {
                healthy += 1;
            } else {
                warn!(
                    port = supervisor.remote_port(),
                    ssh_ok,
                    socks_ok,
                    failures = supervisor.failure_count(),
                    "health check failed"
                );
                if supervisor.failure_count() >= self.max_failure_count {
                    to_recover.push(supervisor.clone());
                }
            }
        }

        // Recoveries of distinct supervisors run concurrently, but every one
        // completes before this supervisor set is probed again.
        if !to_recover.is_empty() {
            let handles: Vec<_> = to_recover
                .into_iter()
                .map(|supervisor| {
                    tokio::spawn(async move {
                        let port = supervisor.remote_port();
                        (port, supervisor.recover().await)
                    })
                })
                .collect();
            for handle in handles {
                match handle.await {
                    Ok((_, Ok(()))) => {}
                    Ok((port, Err(err))) => warn!(port, error = %err, "recovery failed"),
                    Err(err) => {
                        error!(error = %err, "recovery task panicked");
                        tokio::time::sleep(ERROR_PAUSE).await;
                    }
                }
            }
        }

        if healthy == total {
            self.consecutive_failed_ticks = 0;
            debug!(total, "all tunnels healthy");
        } else {
            self.consecutive_failed_ticks += 1;
            warn!(healthy, total, "fleet not fully healthy");
        }
        backoff(self.interval, self.consecutive_failed_ticks)
    }
}

/// Next sleep interval under exponential backoff.
fn backoff(interval: Duration, consecutive_failed_ticks: u32) -> Duration {
    if consecutive_failed_ticks == 0 {
        return interval;
    }
    let factor = 1u32 << consecutive_failed_ticks.min(BACKOFF_MAX_EXPONENT);
    (interval * factor).min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_healthy_keeps_interval() {
        let interval = Duration::from_secs(30);
        assert_eq!(backoff(interval, 0), interval);
    }

    #[test]
    fn test_backoff_doubles_per_failed_tick() {
        let interval = Duration::from_secs(30);
        assert_eq!(backoff(interval, 1), Duration::from_secs(60));
        assert_eq!(backoff(interval, 2), Duration::from_secs(120));
        assert_eq!(backoff(interval, 3), Duration::from_secs(240));
    }

    #[test]
    fn test_backoff_capped_at_300s() {
        let interval = Duration::from_secs(30);
        assert_eq!(backoff(interval, 4), Duration::from_secs(300));
        assert_eq!(backoff(interval, 5), Duration::from_secs(300));
        // The exponent stops growing after five doublings.
        assert_eq!(backoff(interval, 50), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_small_interval() {
        let interval = Duration::from_secs(5);
        assert_eq!(backoff(interval, 5), Duration::from_secs(160));
    }
}
