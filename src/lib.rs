//! torpool - Tor process pool with an HTTP load-balancing front-end
//!
//! Supervises a pool of external SOCKS5 worker processes and exposes a
//! single HTTP proxy endpoint that spreads client requests across the
//! healthy workers.
//!
//! ## Features
//!
//! - Batched parallel startup of up to 400 worker processes with unique
//!   port allocation and TCP readiness probing
//! - Exit-relay fetching, country filtering, and per-worker distribution
//! - HTTP and CONNECT proxying chained over each worker's SOCKS5 endpoint
//! - Round-robin backend selection with cooldown and bounded retry
//! - End-to-end health probing with automatic worker restart

pub mod balancer;
pub mod config;
pub mod error;
pub mod integrator;
pub mod models;
pub mod monitor;
pub mod pool;
pub mod relay;

pub use config::Config;
pub use error::{PoolError, Result};
