//! Ownership of a single worker subprocess.
//!
//! Spawning, readiness probing, liveness, and shutdown for one external
//! SOCKS5 worker. Readiness is a successful TCP connect to the worker's
//! SOCKS port; worker output is forwarded to the log sink and never parsed.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{PoolError, Result};
use crate::models::{WorkerSpec, WorkerState};
use crate::pool::torrc;

/// How often the SOCKS port is probed during startup.
const PROBE_INTERVAL: Duration = Duration::from_millis(200);
/// Per-attempt connect timeout for the readiness probe.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// One worker subprocess and its lifecycle state.
pub struct WorkerProcess {
    spec: WorkerSpec,
    binary: PathBuf,
    startup_timeout: Duration,
    state: WorkerState,
    child: Option<Child>,
    last_ready_at: Option<Instant>,
    last_failure_at: Option<Instant>,
}

impl WorkerProcess {
    pub fn new(spec: WorkerSpec, binary: PathBuf, startup_timeout: Duration) -> Self {
        Self {
            spec,
            binary,
            startup_timeout,
            state: WorkerState::Pending,
            child: None,
            last_ready_at: None,
            last_failure_at: None,
        }
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn last_ready_at(&self) -> Option<Instant> {
        self.last_ready_at
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.last_failure_at
    }

    /// Replace the exit-node assignment; takes effect on the next start.
    pub fn set_exit_nodes(&mut self, exit_nodes: Vec<String>) {
        self.spec.exit_nodes = exit_nodes;
    }

    /// Spawn the subprocess and wait for its SOCKS port to accept a TCP
    /// connection. Returns once the worker is `Ready`, or with the failure
    /// that ended the attempt.
    pub async fn start(&mut self) -> Result<()> {
        self.state = WorkerState::Starting;

        torrc::write(&self.spec).await?;
        self.clear_stale_lock().await;

        let config = torrc::config_path(&self.spec);
        let mut child = Command::new(&self.binary)
            .arg("-f")
            .arg(&config)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.mark_failed();
                PoolError::Spawn(format!("{}: {}", self.binary.display(), e))
            })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(self.spec.id, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(self.spec.id, "stderr", stderr);
        }

        debug!(worker = self.spec.id, "spawned, probing port {}", self.spec.socks_port);

        let deadline = Instant::now() + self.startup_timeout;
        let endpoint = self.spec.socks_endpoint();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    self.mark_failed();
                    return Err(PoolError::UnexpectedExit {
                        id: self.spec.id,
                        status: status.to_string(),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    self.mark_failed();
                    let _ = child.start_kill();
                    return Err(PoolError::Io(e));
                }
            }

            let connected = matches!(
                timeout(PROBE_TIMEOUT, TcpStream::connect(endpoint)).await,
                Ok(Ok(_))
            );
            if connected {
                self.child = Some(child);
                self.state = WorkerState::Ready;
                self.last_ready_at = Some(Instant::now());
                info!(
                    worker = self.spec.id,
                    "ready on socks port {}", self.spec.socks_port
                );
                return Ok(());
            }

            if Instant::now() >= deadline {
                let _ = child.start_kill();
                self.mark_failed();
                return Err(PoolError::StartupTimeout {
                    id: self.spec.id,
                    secs: self.startup_timeout.as_secs(),
                });
            }

            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }

    /// Whether the subprocess is still running.
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Record a failure transition observed by the supervisor.
    pub fn mark_failed(&mut self) {
        self.state = WorkerState::Failed;
        self.last_failure_at = Some(Instant::now());
    }

    /// Signal the subprocess to terminate, escalating to a forced kill
    /// after `grace`.
    pub async fn stop(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            self.state = WorkerState::Stopped;
            return;
        };

        self.state = WorkerState::Stopping;
        info!(worker = self.spec.id, "stopping");
        terminate(&child);

        if timeout(grace, child.wait()).await.is_err() {
            warn!(worker = self.spec.id, "did not exit within grace, killing");
            let _ = child.kill().await;
        }

        self.state = WorkerState::Stopped;
        self.clear_stale_lock().await;
    }

    /// Kill the subprocess without waiting.
    pub async fn force_kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
        self.clear_stale_lock().await;
    }

    /// Delete the worker's data directory. Only called once the worker is
    /// permanently out of the pool.
    pub async fn remove(&self) {
        if let Err(e) = fs::remove_dir_all(&self.spec.data_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    worker = self.spec.id,
                    "failed to remove data dir {}: {}",
                    self.spec.data_dir.display(),
                    e
                );
            }
        }
    }

    /// A crashed worker can leave a stale lock behind that blocks the
    /// next start.
    async fn clear_stale_lock(&self) {
        let lock = self.spec.data_dir.join("lock");
        match fs::remove_file(&lock).await {
            Ok(()) => debug!(worker = self.spec.id, "removed stale lock file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(worker = self.spec.id, "could not remove lock file: {}", e),
        }
    }
}

#[cfg(unix)]
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

fn forward_output<R>(id: usize, stream: &'static str, output: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(output).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(worker = id, stream = stream, "{}", line);
        }
    });
}
