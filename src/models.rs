//! Shared data types: worker lifecycle, relay records, stats snapshots.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    #[default]
    Pending,
    Starting,
    Ready,
    Failed,
    Stopping,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Pending => "pending",
            WorkerState::Starting => "starting",
            WorkerState::Ready => "ready",
            WorkerState::Failed => "failed",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Static description of a worker: everything needed to build its config
/// and spawn it. Ports and exit nodes are stable across restarts.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub id: usize,
    pub socks_port: u16,
    pub control_port: u16,
    pub data_dir: PathBuf,
    pub exit_nodes: Vec<String>,
}

impl WorkerSpec {
    /// The worker's local SOCKS5 endpoint.
    pub fn socks_endpoint(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.socks_port))
    }
}

/// One exit relay as returned by the directory service.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayRecord {
    /// Relay fingerprint (opaque identifier)
    pub fingerprint: String,
    /// First IPv4 address advertised by the relay
    pub address: String,
    /// Two-letter country code, when the directory knows it
    pub country: Option<String>,
    /// Probability of this relay being chosen as an exit
    pub exit_probability: Option<f64>,
}

/// Read-only view of one worker, handed to the health monitor.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub id: usize,
    pub socks_port: u16,
    pub state: WorkerState,
    pub last_ready_at: Option<Instant>,
    pub last_failure_at: Option<Instant>,
    pub restarts: u32,
    /// No longer auto-restarted; cleared on the next reconfiguration
    pub quarantined: bool,
}

/// Per-backend counters included in the stats snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    pub worker_id: usize,
    pub endpoint: String,
    pub healthy: bool,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    /// Milliseconds until the cooldown expires; 0 when not cooling down
    pub cooldown_remaining_ms: u64,
}

/// Point-in-time statistics exposed by the Integrator.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub workers_total: usize,
    pub workers_ready: usize,
    pub backends_eligible: usize,
    pub requests_total: u64,
    pub requests_failed: u64,
    pub backends: Vec<BackendStats>,
    pub generated_at: DateTime<Utc>,
}
