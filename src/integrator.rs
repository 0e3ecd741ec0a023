//! Top-level wiring: startup sequence, signal handling, graceful
//! shutdown, and the stats snapshot.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use crate::balancer::{BackendPool, HandlerConfig, ProxyHandler, ProxyServer};
use crate::config::Config;
use crate::error::Result;
use crate::models::{StatsSnapshot, WorkerState, WorkerStatus};
use crate::monitor::HealthMonitor;
use crate::pool::{PoolEvent, PoolManager};
use crate::relay::{self, DirectoryClient};

/// Window for in-flight client requests to finish after shutdown begins.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Run the whole system until a shutdown signal arrives.
pub async fn run(config: Config) -> Result<()> {
    run_with_shutdown(config, shutdown_signal()).await
}

/// Run the whole system until `shutdown` resolves.
///
/// Startup order: bind the front-end listener (fail fast on a taken
/// port), start the worker pool, then attach monitor and server tasks.
pub async fn run_with_shutdown<F>(config: Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let backends = Arc::new(BackendPool::new(
        config.frontend.cooldown,
        config.frontend.cooldown_probe,
    ));

    let handler = Arc::new(ProxyHandler::new(
        backends.clone(),
        HandlerConfig {
            retry_attempts: config.frontend.retry_attempts,
            connect_timeout: config.frontend.connect_timeout,
            request_timeout: config.frontend.request_timeout,
        },
    ));
    let server = ProxyServer::bind(config.frontend.listen, handler.clone()).await?;

    let manager = PoolManager::start(&config, backends.clone()).await?;
    info!("pool started, frontend on {}", config.frontend.listen);

    let (shutdown_tx, _) = watch::channel(false);

    let monitor = HealthMonitor::new(
        config.health.clone(),
        config.pool.start_batch,
        manager.status(),
        manager.events(),
    );
    let monitor_task = tokio::spawn(monitor.run(shutdown_tx.subscribe()));
    let server_task = tokio::spawn(server.run(shutdown_tx.subscribe(), DRAIN_GRACE));

    let refresh_task = config.relay.refresh_interval.map(|refresh_interval| {
        let relay_config = config.relay.clone();
        let worker_count = config.pool.worker_count;
        let events = manager.events();
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            let client = DirectoryClient::new(relay_config.clone());
            let mut ticker = tokio::time::interval(refresh_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let relays = client.fetch_or_empty().await;
                        if relays.is_empty() {
                            continue;
                        }
                        let buckets = relay::distribute(
                            &relays,
                            worker_count,
                            relay_config.exit_nodes_per_worker,
                        );
                        let _ = events.send(PoolEvent::RefreshExitNodes(buckets)).await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    });

    // Periodic stats line so operators can see the pool breathing.
    let stats_task = {
        let status_rx = manager.status();
        let backends = backends.clone();
        let handler = handler.clone();
        let stats_interval = config.health.interval;
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(stats_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snap = snapshot(&status_rx.borrow(), &backends, &handler);
                        match serde_json::to_string(&snap) {
                            Ok(json) => info!(target: "torpool::stats", "{}", json),
                            Err(e) => error!("failed to serialize stats: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    shutdown.await;
    info!("shutdown signal received");

    // Stop accepting, drain in-flight requests, stop background loops,
    // then take the workers down and clean up their directories.
    let _ = shutdown_tx.send(true);
    let _ = server_task.await;
    let _ = monitor_task.await;
    let _ = stats_task.await;
    if let Some(task) = refresh_task {
        let _ = task.await;
    }
    manager.shutdown().await;

    info!("clean shutdown complete");
    Ok(())
}

/// Build the stats snapshot from the live components.
pub fn snapshot(
    workers: &[WorkerStatus],
    backends: &BackendPool,
    handler: &ProxyHandler,
) -> StatsSnapshot {
    StatsSnapshot {
        workers_total: workers.len(),
        workers_ready: workers
            .iter()
            .filter(|w| w.state == WorkerState::Ready)
            .count(),
        backends_eligible: backends.eligible_count(),
        requests_total: handler.requests_total(),
        requests_failed: handler.requests_failed(),
        backends: backends.stats(),
        generated_at: Utc::now(),
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
