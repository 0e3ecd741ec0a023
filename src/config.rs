//! Process-wide configuration, resolved once at startup.
//!
//! The core consumes a fully-resolved [`Config`]; environment variables are
//! the only input surface and every recognized option carries a default.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PoolError, Result};

const MAX_WORKERS: usize = 400;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker pool configuration
    pub pool: PoolConfig,
    /// Exit-relay directory configuration
    pub relay: RelayConfig,
    /// Health monitor configuration
    pub health: HealthConfig,
    /// Front-end load balancer configuration
    pub frontend: FrontendConfig,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker processes (1..=400)
    pub worker_count: usize,
    /// Lowest port of the allocation window
    pub base_port: u16,
    /// Highest port of the allocation window (inclusive)
    pub max_port: u16,
    /// Maximum parallel spawns per startup batch
    pub start_batch: usize,
    /// Path to the worker binary
    pub worker_binary: PathBuf,
    /// Time allowed for a worker to open its SOCKS port
    pub startup_timeout: Duration,
    /// Grace period before a stopping worker is force-killed
    pub stop_grace: Duration,
    /// Root directory holding per-worker data directories
    pub data_root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Directory service endpoint returning relay metadata
    pub directory_url: String,
    /// Exit relays pinned per worker; 0 disables pinning
    pub exit_nodes_per_worker: usize,
    /// Global cap on relays fetched from the directory
    pub exit_nodes_max: usize,
    /// Optional two-letter country codes restricting exit selection
    pub countries: Vec<String>,
    /// Re-fetch and re-distribute interval; None fetches once at startup
    pub refresh_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Absolute URL probed end-to-end through each worker
    pub check_url: String,
    /// Interval between probe cycles
    pub interval: Duration,
    /// Per-probe timeout
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct FrontendConfig {
    /// Listen address of the HTTP proxy front-end
    pub listen: SocketAddr,
    /// Maximum backends tried per client request
    pub retry_attempts: u32,
    /// Time a failed backend is skipped by selection
    pub cooldown: Duration,
    /// When every backend is cooling down, pick the least-recently-failed
    /// one instead of returning 502
    pub cooldown_probe: bool,
    /// Timeout for dialing a backend's SOCKS endpoint
    pub connect_timeout: Duration,
    /// Timeout for the upstream request/response exchange
    pub request_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Config {
            pool: PoolConfig {
                worker_count: parse_env("TORPOOL_WORKERS", "10")?,
                base_port: parse_env("TORPOOL_BASE_PORT", "19050")?,
                max_port: parse_env("TORPOOL_MAX_PORT", "29999")?,
                start_batch: parse_env("TORPOOL_START_BATCH", "20")?,
                worker_binary: PathBuf::from(get_env_or("TORPOOL_WORKER_BINARY", "tor")),
                startup_timeout: Duration::from_secs(parse_env(
                    "TORPOOL_STARTUP_TIMEOUT_SECS",
                    "45",
                )?),
                stop_grace: Duration::from_secs(parse_env("TORPOOL_STOP_GRACE_SECS", "5")?),
                data_root: PathBuf::from(get_env_or("TORPOOL_DATA_ROOT", "/var/lib/torpool")),
            },
            relay: RelayConfig {
                directory_url: get_env_or(
                    "TORPOOL_DIRECTORY_URL",
                    "https://onionoo.torproject.org/details?flag=Exit&running=true",
                ),
                exit_nodes_per_worker: parse_env("TORPOOL_EXIT_NODES_PER_WORKER", "0")?,
                exit_nodes_max: parse_env("TORPOOL_EXIT_NODES_MAX", "500")?,
                countries: get_env_or("TORPOOL_EXIT_COUNTRIES", "")
                    .split(',')
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect(),
                refresh_interval: match parse_env::<u64>("TORPOOL_EXIT_REFRESH_SECS", "0")? {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
            },
            health: HealthConfig {
                check_url: get_env_or("TORPOOL_HEALTH_URL", "https://check.torproject.org/api/ip"),
                interval: Duration::from_secs(parse_env("TORPOOL_HEALTH_INTERVAL_SECS", "60")?),
                timeout: Duration::from_secs(parse_env("TORPOOL_HEALTH_TIMEOUT_SECS", "15")?),
            },
            frontend: FrontendConfig {
                listen: get_env_or("TORPOOL_LISTEN", "127.0.0.1:8080")
                    .parse()
                    .map_err(|_| {
                        PoolError::InvalidConfig(
                            "TORPOOL_LISTEN must be a host:port address".into(),
                        )
                    })?,
                retry_attempts: parse_env("TORPOOL_RETRY_ATTEMPTS", "3")?,
                cooldown: Duration::from_secs(parse_env("TORPOOL_COOLDOWN_SECS", "30")?),
                cooldown_probe: parse_env("TORPOOL_COOLDOWN_PROBE", "false")?,
                connect_timeout: Duration::from_secs(parse_env(
                    "TORPOOL_CONNECT_TIMEOUT_SECS",
                    "10",
                )?),
                request_timeout: Duration::from_secs(parse_env(
                    "TORPOOL_REQUEST_TIMEOUT_SECS",
                    "30",
                )?),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants that per-field parsing cannot catch.
    pub fn validate(&self) -> Result<()> {
        let pool = &self.pool;

        if pool.worker_count == 0 || pool.worker_count > MAX_WORKERS {
            return Err(PoolError::InvalidConfig(format!(
                "TORPOOL_WORKERS must be between 1 and {}, got {}",
                MAX_WORKERS, pool.worker_count
            )));
        }

        let needed = pool.worker_count * 2;
        let window = (pool.max_port as usize).saturating_sub(pool.base_port as usize) + 1;
        if pool.base_port == 0 || pool.max_port < pool.base_port || window < needed {
            return Err(PoolError::InvalidConfig(format!(
                "port window {}..={} cannot hold {} ports",
                pool.base_port, pool.max_port, needed
            )));
        }

        if pool.start_batch == 0 {
            return Err(PoolError::InvalidConfig(
                "TORPOOL_START_BATCH must be at least 1".into(),
            ));
        }

        if self.health.check_url.is_empty() {
            return Err(PoolError::InvalidConfig(
                "TORPOOL_HEALTH_URL must not be empty".into(),
            ));
        }

        for code in &self.relay.countries {
            if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(PoolError::InvalidConfig(format!(
                    "TORPOOL_EXIT_COUNTRIES entries must be two-letter codes, got {:?}",
                    code
                )));
            }
        }

        Ok(())
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default).parse().map_err(|_| {
        PoolError::InvalidConfig(format!(
            "{} must be a valid {}",
            key,
            std::any::type_name::<T>()
        ))
    })
}
