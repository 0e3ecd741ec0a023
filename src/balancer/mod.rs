//! HTTP load-balancing front-end over the worker pool.
//!
//! The backend pool is the single shared mutable structure; the server and
//! handler only read membership through `pick()` and record outcomes
//! through the `mark_*` calls.

pub mod handler;
pub mod pool;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use handler::{HandlerConfig, ProxyHandler};
pub use pool::{Backend, BackendPool};
pub use server::ProxyServer;
