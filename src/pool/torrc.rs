//! Worker configuration fragments.
//!
//! Everything a worker needs is written into its `torrc`; there are no
//! hidden defaults shared between supervisor and worker.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::error::Result;
use crate::models::WorkerSpec;

/// Render the configuration fragment for one worker.
pub fn render(spec: &WorkerSpec) -> String {
    let mut lines = vec![
        format!("SocksPort 127.0.0.1:{}", spec.socks_port),
        format!("ControlPort 127.0.0.1:{}", spec.control_port),
        format!("DataDirectory {}", spec.data_dir.display()),
        "ClientOnly 1".to_string(),
        "ExitRelay 0".to_string(),
        "AvoidDiskWrites 1".to_string(),
        "MaxCircuitDirtiness 60".to_string(),
    ];

    if !spec.exit_nodes.is_empty() {
        lines.push(format!("ExitNodes {}", spec.exit_nodes.join(",")));
        lines.push("StrictNodes 1".to_string());
    }

    lines.join("\n") + "\n"
}

/// Path of the worker's configuration file.
pub fn config_path(spec: &WorkerSpec) -> PathBuf {
    spec.data_dir.join("torrc")
}

/// Create the data directory and write the configuration fragment.
pub async fn write(spec: &WorkerSpec) -> Result<PathBuf> {
    fs::create_dir_all(&spec.data_dir).await?;
    let path = config_path(spec);
    fs::write(&path, render(spec)).await?;
    debug!(worker = spec.id, "wrote worker config to {}", path.display());
    Ok(path)
}

/// Argument vector for launching a worker with the given config file.
pub fn argv(worker_binary: &Path, config: &Path) -> Vec<String> {
    vec![
        worker_binary.display().to_string(),
        "-f".to_string(),
        config.display().to_string(),
    ]
}
