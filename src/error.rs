use thiserror::Error;

/// Unified error type for the torpool process.
#[derive(Error, Debug)]
pub enum PoolError {
    // Configuration errors
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Relay directory errors
    #[error("relay directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("relay directory returned malformed data: {0}")]
    DirectoryMalformed(String),

    // Per-worker lifecycle errors
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("worker {id} did not become ready within {secs}s")]
    StartupTimeout { id: usize, secs: u64 },

    #[error("worker {id} exited before becoming ready ({status})")]
    UnexpectedExit { id: usize, status: String },

    #[error("all workers failed to start")]
    AllWorkersFailed,

    #[error("health probe failed: {0}")]
    ProbeFailure(String),

    // Per-request errors
    #[error("backend dial failed: {0}")]
    BackendDial(String),

    #[error("SOCKS5 negotiation failed: {0}")]
    SocksNegotiation(String),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("no backend available")]
    NoBackendAvailable,

    #[error("malformed client request: {0}")]
    ClientProtocol(String),

    // Fatal startup errors
    #[error("failed to bind listener: {0}")]
    ListenerBind(String),

    // I/O and protocol plumbing
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for torpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Whether the balancer may retry this failure on another backend.
    ///
    /// Only connection-level failures qualify; an HTTP response with an
    /// error status is forwarded verbatim and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::BackendDial(_) | PoolError::SocksNegotiation(_) | PoolError::UpstreamTimeout
        )
    }

    /// Process exit code when this error terminates the Integrator.
    pub fn exit_code(&self) -> i32 {
        match self {
            PoolError::InvalidConfig(_) => 1,
            PoolError::AllWorkersFailed => 2,
            PoolError::ListenerBind(_) => 3,
            _ => 1,
        }
    }
}

impl From<hyper::Error> for PoolError {
    fn from(err: hyper::Error) -> Self {
        PoolError::Http(err.to_string())
    }
}
