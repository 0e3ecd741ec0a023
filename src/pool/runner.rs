//! Batched parallel worker startup.
//!
//! Launching hundreds of workers at once hammers disk and CPU; startup is
//! chunked so at most `fan_out` workers come up concurrently, and a chunk
//! completes before the next begins.

use futures::future::join_all;
use tracing::{info, warn};

use crate::error::Result;
use crate::pool::worker::WorkerProcess;

/// Start every worker, at most `fan_out` at a time. Returns one result per
/// worker, in worker order.
pub async fn run(workers: &mut [WorkerProcess], fan_out: usize) -> Vec<Result<()>> {
    let fan_out = fan_out.max(1);
    let total = workers.len();
    let mut results = Vec::with_capacity(total);

    for (batch_index, chunk) in workers.chunks_mut(fan_out).enumerate() {
        info!(
            "starting batch {} ({} workers of {})",
            batch_index + 1,
            chunk.len(),
            total
        );
        let outcomes = join_all(chunk.iter_mut().map(|worker| worker.start())).await;
        for outcome in &outcomes {
            if let Err(e) = outcome {
                warn!("worker failed to start: {}", e);
            }
        }
        results.extend(outcomes);
    }

    results
}
