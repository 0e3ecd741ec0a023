//! Pool supervision: canonical worker set, startup sequence, and
//! restart-on-failure.
//!
//! The supervisor owns every [`WorkerProcess`] and is the only component
//! that mutates worker state. The health monitor reports failures through
//! a [`PoolEvent`] channel; topology changes flow to the shared
//! [`BackendPool`] as `add`/`remove` calls, with `remove` always ordered
//! before any other post-transition action.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::balancer::BackendPool;
use crate::config::Config;
use crate::error::{PoolError, Result};
use crate::models::{WorkerSpec, WorkerState, WorkerStatus};
use crate::pool::worker::WorkerProcess;
use crate::pool::{ports, runner};
use crate::relay::{self, DirectoryClient};

/// Consecutive start failures before a worker is quarantined.
const MAX_START_FAILURES: u32 = 5;
const RESTART_BACKOFF_STEP: Duration = Duration::from_secs(1);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(5);
/// Cadence of the supervisor's own liveness sweep over ready workers.
const LIVENESS_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Supervision events delivered to the pool manager.
#[derive(Debug)]
pub enum PoolEvent {
    /// Health probes for this worker crossed the failure threshold.
    WorkerUnhealthy(usize),
    /// The worker's process is gone.
    WorkerExited(usize),
    /// New exit-node buckets from a directory refresh; also lifts
    /// quarantines.
    RefreshExitNodes(Vec<Vec<String>>),
}

struct WorkerSlot {
    process: WorkerProcess,
    consecutive_start_failures: u32,
    restarts: u32,
    quarantined: bool,
}

/// Handle to the supervision task.
#[derive(Debug)]
pub struct PoolManager {
    events: mpsc::Sender<PoolEvent>,
    status: watch::Receiver<Vec<WorkerStatus>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PoolManager {
    /// Run the startup sequence and hand the pool to a supervision task.
    ///
    /// Workers that fail to start stay in the pool as `failed`; only a
    /// fully failed startup is an error.
    pub async fn start(config: &Config, backends: Arc<BackendPool>) -> Result<PoolManager> {
        let pairs = ports::allocate(
            config.pool.worker_count,
            config.pool.base_port,
            config.pool.max_port,
        )?;

        let relays = if config.relay.exit_nodes_per_worker > 0 {
            DirectoryClient::new(config.relay.clone()).fetch_or_empty().await
        } else {
            Vec::new()
        };
        let buckets = relay::distribute(
            &relays,
            config.pool.worker_count,
            config.relay.exit_nodes_per_worker,
        );

        let mut workers: Vec<WorkerProcess> = pairs
            .into_iter()
            .zip(buckets)
            .enumerate()
            .map(|(id, (pair, exit_nodes))| {
                let spec = WorkerSpec {
                    id,
                    socks_port: pair.socks_port,
                    control_port: pair.control_port,
                    data_dir: config.pool.data_root.join(format!("worker_{:03}", id)),
                    exit_nodes,
                };
                WorkerProcess::new(
                    spec,
                    config.pool.worker_binary.clone(),
                    config.pool.startup_timeout,
                )
            })
            .collect();

        let results = runner::run(&mut workers, config.pool.start_batch).await;
        let ready = results.iter().filter(|r| r.is_ok()).count();
        info!("{}/{} workers ready", ready, workers.len());

        if ready == 0 {
            join_all(workers.iter().map(|w| w.remove())).await;
            return Err(PoolError::AllWorkersFailed);
        }

        for (worker, result) in workers.iter().zip(&results) {
            if result.is_ok() {
                backends.add(worker.spec().id, worker.spec().socks_endpoint());
            }
        }

        let slots: Vec<WorkerSlot> = workers
            .into_iter()
            .zip(results)
            .map(|(process, result)| WorkerSlot {
                consecutive_start_failures: u32::from(result.is_err()),
                restarts: 0,
                quarantined: false,
                process,
            })
            .collect();

        let (event_tx, event_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(status_of(&slots));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = Supervisor {
            slots,
            backends,
            status_tx,
            stop_grace: config.pool.stop_grace,
            event_rx,
            shutdown_rx,
        };
        let task = tokio::spawn(supervisor.run());

        Ok(PoolManager {
            events: event_tx,
            status: status_rx,
            shutdown: shutdown_tx,
            task,
        })
    }

    /// Sender for supervision events (cloned into the health monitor).
    pub fn events(&self) -> mpsc::Sender<PoolEvent> {
        self.events.clone()
    }

    /// Read-only worker status snapshots.
    pub fn status(&self) -> watch::Receiver<Vec<WorkerStatus>> {
        self.status.clone()
    }

    /// Stop every worker concurrently and remove their data directories.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("supervisor task failed: {}", e);
        }
    }
}

struct Supervisor {
    slots: Vec<WorkerSlot>,
    backends: Arc<BackendPool>,
    status_tx: watch::Sender<Vec<WorkerStatus>>,
    stop_grace: Duration,
    event_rx: mpsc::Receiver<PoolEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut sweep = tokio::time::interval(LIVENESS_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.event_rx.recv() => match event {
                    Some(event) => {
                        self.handle_event(event).await;
                        self.publish();
                    }
                    None => break,
                },
                _ = sweep.tick() => self.sweep_liveness().await,
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.stop_all().await;
    }

    async fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::WorkerUnhealthy(id) => self.restart(id, "unhealthy").await,
            PoolEvent::WorkerExited(id) => self.restart(id, "exited").await,
            PoolEvent::RefreshExitNodes(buckets) => self.refresh_exit_nodes(buckets),
        }
    }

    /// Catch workers whose process died between health cycles.
    async fn sweep_liveness(&mut self) {
        let dead: Vec<usize> = self
            .slots
            .iter_mut()
            .filter_map(|slot| {
                if slot.process.state() == WorkerState::Ready && !slot.process.is_alive() {
                    Some(slot.process.spec().id)
                } else {
                    None
                }
            })
            .collect();

        if dead.is_empty() {
            return;
        }
        for id in dead {
            warn!(worker = id, "process exited unexpectedly");
            self.restart(id, "exited").await;
        }
        self.publish();
    }

    /// Restart a failed worker with its original id, ports, and exit
    /// nodes. Linear backoff between attempts; quarantine after
    /// [`MAX_START_FAILURES`] consecutive failures.
    ///
    /// A backoff sleep or start attempt can span tens of seconds, so both
    /// race the shutdown signal; an abandoned restart leaves the worker
    /// `failed` for `stop_all` to finish off.
    async fn restart(&mut self, id: usize, reason: &str) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow() {
            return;
        }

        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        if slot.quarantined {
            debug!(worker = id, "quarantined, not restarting");
            return;
        }
        if matches!(
            slot.process.state(),
            WorkerState::Stopping | WorkerState::Stopped
        ) {
            return;
        }

        info!(worker = id, "restarting worker ({})", reason);

        // Detach from selection before anything else so pick() cannot
        // return the failed backend after this point.
        self.backends.remove(id);
        slot.process.mark_failed();
        slot.process.force_kill().await;

        while slot.consecutive_start_failures < MAX_START_FAILURES {
            let backoff =
                (RESTART_BACKOFF_STEP * slot.consecutive_start_failures).min(RESTART_BACKOFF_CAP);
            if !backoff.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown_requested(&mut shutdown_rx) => {
                        debug!(worker = id, "shutdown requested, abandoning restart");
                        return;
                    }
                }
            }

            slot.restarts += 1;
            let outcome = tokio::select! {
                result = slot.process.start() => result,
                _ = shutdown_requested(&mut shutdown_rx) => {
                    debug!(worker = id, "shutdown requested, abandoning restart");
                    slot.process.mark_failed();
                    slot.process.force_kill().await;
                    return;
                }
            };

            match outcome {
                Ok(()) => {
                    slot.consecutive_start_failures = 0;
                    self.backends
                        .add(id, slot.process.spec().socks_endpoint());
                    info!(worker = id, "worker restarted");
                    return;
                }
                Err(e) => {
                    slot.consecutive_start_failures += 1;
                    warn!(
                        worker = id,
                        "restart attempt {} failed: {}", slot.consecutive_start_failures, e
                    );
                }
            }
        }

        slot.quarantined = true;
        error!(
            worker = id,
            "quarantined after {} consecutive start failures", MAX_START_FAILURES
        );
    }

    /// Apply refreshed exit-node buckets. Configs are rewritten on the
    /// next start of each worker; quarantines are lifted because this is
    /// an external reconfiguration.
    fn refresh_exit_nodes(&mut self, buckets: Vec<Vec<String>>) {
        for slot in &mut self.slots {
            let id = slot.process.spec().id;
            if let Some(nodes) = buckets.get(id) {
                slot.process.set_exit_nodes(nodes.clone());
            }
            if slot.quarantined {
                info!(worker = id, "quarantine lifted by reconfiguration");
                slot.quarantined = false;
                slot.consecutive_start_failures = 0;
            }
        }
    }

    async fn stop_all(&mut self) {
        info!("stopping {} workers", self.slots.len());
        let grace = self.stop_grace;
        join_all(
            self.slots
                .iter_mut()
                .map(|slot| slot.process.stop(grace)),
        )
        .await;
        join_all(self.slots.iter().map(|slot| slot.process.remove())).await;
        self.publish();
    }

    fn publish(&self) {
        let _ = self.status_tx.send(status_of(&self.slots));
    }
}

/// Completes once shutdown has been requested, or the handle is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn status_of(slots: &[WorkerSlot]) -> Vec<WorkerStatus> {
    slots
        .iter()
        .map(|slot| WorkerStatus {
            id: slot.process.spec().id,
            socks_port: slot.process.spec().socks_port,
            state: slot.process.state(),
            last_ready_at: slot.process.last_ready_at(),
            last_failure_at: slot.process.last_failure_at(),
            restarts: slot.restarts,
            quarantined: slot.quarantined,
        })
        .collect()
}
