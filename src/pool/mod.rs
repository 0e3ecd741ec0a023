//! Worker pool supervision.
//!
//! Port allocation, per-worker configuration, subprocess lifecycle, batched
//! startup, and the supervising manager.

pub mod manager;
pub mod ports;
pub mod runner;
pub mod torrc;
pub mod worker;

pub use manager::{PoolEvent, PoolManager};
pub use ports::PortPair;
pub use worker::WorkerProcess;
