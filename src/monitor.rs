//! End-to-end health probing of ready workers.
//!
//! One logical loop: every cycle, each ready worker gets an HTTP GET of
//! the check URL routed through its SOCKS port. Three consecutive failures
//! report the worker to the supervisor; the monitor itself never touches
//! processes.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::error::{PoolError, Result};
use crate::models::{WorkerState, WorkerStatus};
use crate::pool::PoolEvent;

/// Consecutive probe failures before a worker is reported unhealthy.
const PROBE_FAILURE_THRESHOLD: u32 = 3;
/// Per-worker onset skew so a cycle's probes do not fire as one burst.
const PROBE_SKEW_STEP: Duration = Duration::from_millis(50);
const PROBE_SKEW_MAX: Duration = Duration::from_secs(1);

/// Background health monitor for the worker pool.
pub struct HealthMonitor {
    config: HealthConfig,
    fan_out: usize,
    status: watch::Receiver<Vec<WorkerStatus>>,
    events: mpsc::Sender<PoolEvent>,
    /// Consecutive failures indexed by worker id (ids are dense).
    failures: Vec<u32>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        fan_out: usize,
        status: watch::Receiver<Vec<WorkerStatus>>,
        events: mpsc::Sender<PoolEvent>,
    ) -> Self {
        let worker_count = status.borrow().len();
        Self {
            config,
            fan_out: fan_out.max(1),
            status,
            events,
            failures: vec![0; worker_count],
        }
    }

    /// Run probe cycles until shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "health monitor started ({}s interval, {} probe timeout)",
            self.config.interval.as_secs(),
            self.config.timeout.as_secs()
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => self.cycle().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One probe cycle over the current worker snapshot.
    async fn cycle(&mut self) {
        let snapshot = self.status.borrow().clone();

        // Nudge the supervisor about workers stuck in failed so restarts
        // keep being attempted between quarantines.
        for worker in &snapshot {
            if worker.state == WorkerState::Failed && !worker.quarantined {
                let _ = self.events.send(PoolEvent::WorkerExited(worker.id)).await;
            }
        }

        let ready: Vec<(usize, u16)> = snapshot
            .iter()
            .filter(|w| w.state == WorkerState::Ready)
            .map(|w| (w.id, w.socks_port))
            .collect();
        if ready.is_empty() {
            return;
        }
        debug!("probing {} ready workers", ready.len());

        let url = self.config.check_url.clone();
        let probe_timeout = self.config.timeout;
        let results: Vec<(usize, Result<()>)> =
            futures::stream::iter(ready.into_iter().map(|(id, port)| {
                let url = url.clone();
                async move {
                    tokio::time::sleep((PROBE_SKEW_STEP * id as u32).min(PROBE_SKEW_MAX)).await;
                    (id, probe(&url, port, probe_timeout).await)
                }
            }))
            .buffer_unordered(self.fan_out)
            .collect()
            .await;

        for (id, result) in results {
            let Some(failures) = self.failures.get_mut(id) else {
                continue;
            };
            match result {
                Ok(()) => *failures = 0,
                Err(e) => {
                    *failures += 1;
                    warn!(
                        worker = id,
                        "probe failed ({}/{}): {}", failures, PROBE_FAILURE_THRESHOLD, e
                    );
                    if *failures >= PROBE_FAILURE_THRESHOLD {
                        *failures = 0;
                        let _ = self.events.send(PoolEvent::WorkerUnhealthy(id)).await;
                    }
                }
            }
        }
    }
}

/// HTTP GET of `url` through the worker's SOCKS port; 2xx is healthy.
async fn probe(url: &str, socks_port: u16, probe_timeout: Duration) -> Result<()> {
    let proxy = reqwest::Proxy::all(format!("socks5h://127.0.0.1:{}", socks_port))
        .map_err(|e| PoolError::ProbeFailure(e.to_string()))?;
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(probe_timeout)
        .build()
        .map_err(|e| PoolError::ProbeFailure(e.to_string()))?;

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| PoolError::ProbeFailure(e.to_string()))?;

    if !response.status().is_success() {
        return Err(PoolError::ProbeFailure(format!(
            "status {}",
            response.status()
        )));
    }
    Ok(())
}
