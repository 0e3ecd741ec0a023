//! Partitioning of exit relays across workers.

use std::collections::HashSet;

use crate::models::RelayRecord;

/// Partition `relays` into `worker_count` buckets of at most `per_worker`
/// fingerprints each.
///
/// Relays are ranked by descending exit probability (missing counts as
/// zero), ties broken by fingerprint, then dealt round-robin. When fewer
/// relays exist than requested, buckets simply stay short. Buckets are
/// indexed by worker id.
pub fn distribute(
    relays: &[RelayRecord],
    worker_count: usize,
    per_worker: usize,
) -> Vec<Vec<String>> {
    let mut buckets = vec![Vec::new(); worker_count];
    if worker_count == 0 || per_worker == 0 || relays.is_empty() {
        return buckets;
    }

    let mut ranked: Vec<&RelayRecord> = relays.iter().collect();
    ranked.sort_by(|a, b| {
        b.exit_probability
            .unwrap_or(0.0)
            .total_cmp(&a.exit_probability.unwrap_or(0.0))
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });

    let mut seen = HashSet::new();
    let mut target = 0usize;
    for relay in ranked {
        if !seen.insert(relay.fingerprint.as_str()) {
            continue;
        }
        // Skip buckets that already hold their share.
        let mut scanned = 0;
        while buckets[target].len() >= per_worker {
            target = (target + 1) % worker_count;
            scanned += 1;
            if scanned == worker_count {
                return buckets;
            }
        }
        buckets[target].push(relay.fingerprint.clone());
        target = (target + 1) % worker_count;
    }

    buckets
}
