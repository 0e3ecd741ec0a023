//! Backend set shared between the supervisor and the front-end.
//!
//! The only mutable cross-component state in the process. Selection is
//! strict round-robin over the eligible subset; a failed backend cools
//! down for a configured window before it is picked again.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::models::BackendStats;

/// The balancer's view of one ready worker.
///
/// Counters live behind atomics so a request holding an `Arc<Backend>`
/// across a concurrent `remove` can still record its outcome.
#[derive(Debug)]
pub struct Backend {
    pub worker_id: usize,
    pub endpoint: SocketAddr,
    healthy: AtomicBool,
    cooldown_until: Mutex<Option<Instant>>,
    consecutive_failures: AtomicU32,
    success_count: AtomicU64,
    failure_count: AtomicU64,
}

impl Backend {
    fn new(worker_id: usize, endpoint: SocketAddr) -> Self {
        Self {
            worker_id,
            endpoint,
            healthy: AtomicBool::new(true),
            cooldown_until: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
        }
    }

    /// Eligible for selection: healthy and not cooling down.
    fn eligible(&self, now: Instant) -> bool {
        if !self.healthy.load(Ordering::Relaxed) {
            return false;
        }
        match *self.cooldown_until.lock() {
            Some(until) => now >= until,
            None => true,
        }
    }

    fn cooldown_remaining(&self, now: Instant) -> Duration {
        match *self.cooldown_until.lock() {
            Some(until) if until > now => until - now,
            _ => Duration::ZERO,
        }
    }

    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct Inner {
    backends: Vec<Arc<Backend>>,
    cursor: usize,
}

/// Round-robin backend pool with per-backend cooldown.
#[derive(Debug)]
pub struct BackendPool {
    inner: Mutex<Inner>,
    cooldown: Duration,
    /// When every backend is cooling down, pick the least-recently-failed
    /// one instead of reporting exhaustion.
    cooldown_probe: bool,
}

impl BackendPool {
    pub fn new(cooldown: Duration, cooldown_probe: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                backends: Vec::new(),
                cursor: 0,
            }),
            cooldown,
            cooldown_probe,
        }
    }

    /// Append a backend for a worker; duplicates by worker id are ignored.
    pub fn add(&self, worker_id: usize, endpoint: SocketAddr) {
        let mut inner = self.inner.lock();
        if inner.backends.iter().any(|b| b.worker_id == worker_id) {
            debug!(worker = worker_id, "backend already present, skipping add");
            return;
        }
        inner.backends.push(Arc::new(Backend::new(worker_id, endpoint)));
        info!(worker = worker_id, "backend {} joined the pool", endpoint);
    }

    /// Remove a worker's backend. A request already holding the backend
    /// may finish with it; later picks will not return it.
    pub fn remove(&self, worker_id: usize) {
        let mut inner = self.inner.lock();
        let before = inner.backends.len();
        if let Some(index) = inner.backends.iter().position(|b| b.worker_id == worker_id) {
            inner.backends.remove(index);
            // Keep the rotation anchored on the slot after the removed one.
            if index < inner.cursor {
                inner.cursor -= 1;
            }
        }
        if inner.backends.len() < before {
            info!(worker = worker_id, "backend left the pool");
        }
    }

    /// Next eligible backend in round-robin order, skipping `exclude`.
    pub fn pick(&self, exclude: &HashSet<usize>) -> Option<Arc<Backend>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let len = inner.backends.len();
        if len == 0 {
            return None;
        }

        let start = inner.cursor % len;
        for offset in 0..len {
            let index = (start + offset) % len;
            let backend = &inner.backends[index];
            if exclude.contains(&backend.worker_id) || !backend.eligible(now) {
                continue;
            }
            let picked = Arc::clone(backend);
            inner.cursor = index + 1;
            return Some(picked);
        }

        if self.cooldown_probe {
            // Availability over strict cooldown: take the backend whose
            // cooldown expires soonest.
            return inner
                .backends
                .iter()
                .filter(|b| !exclude.contains(&b.worker_id) && b.healthy.load(Ordering::Relaxed))
                .min_by_key(|b| b.cooldown_remaining(now))
                .map(Arc::clone);
        }

        None
    }

    /// Record a successful exchange through `backend`.
    pub fn mark_success(&self, backend: &Backend) {
        backend.success_count.fetch_add(1, Ordering::Relaxed);
        backend.consecutive_failures.store(0, Ordering::Relaxed);
        *backend.cooldown_until.lock() = None;
    }

    /// Record a connection-level failure and put the backend on cooldown.
    pub fn mark_failure(&self, backend: &Backend) {
        backend.failure_count.fetch_add(1, Ordering::Relaxed);
        backend.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        *backend.cooldown_until.lock() = Some(Instant::now() + self.cooldown);
        debug!(
            worker = backend.worker_id,
            "backend cooling down for {:?}", self.cooldown
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backends currently eligible for selection.
    pub fn eligible_count(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .backends
            .iter()
            .filter(|b| b.eligible(now))
            .count()
    }

    /// Per-backend counters for the stats snapshot.
    pub fn stats(&self) -> Vec<BackendStats> {
        let now = Instant::now();
        self.inner
            .lock()
            .backends
            .iter()
            .map(|b| BackendStats {
                worker_id: b.worker_id,
                endpoint: b.endpoint.to_string(),
                healthy: b.healthy.load(Ordering::Relaxed),
                success_count: b.success_count(),
                failure_count: b.failure_count(),
                consecutive_failures: b.consecutive_failures(),
                cooldown_remaining_ms: b.cooldown_remaining(now).as_millis() as u64,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn pool_of(n: usize) -> BackendPool {
        let pool = BackendPool::new(Duration::from_secs(30), false);
        for id in 0..n {
            pool.add(id, endpoint(19050 + id as u16));
        }
        pool
    }

    fn pick_ids(pool: &BackendPool, count: usize) -> Vec<usize> {
        let none = HashSet::new();
        (0..count)
            .map(|_| pool.pick(&none).unwrap().worker_id)
            .collect()
    }

    #[test]
    fn test_pick_empty_pool_returns_none() {
        let pool = BackendPool::new(Duration::from_secs(1), false);
        assert!(pool.pick(&HashSet::new()).is_none());
    }

    #[test]
    fn test_pick_round_robin_order() {
        let pool = pool_of(3);
        assert_eq!(pick_ids(&pool, 6), vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_round_robin_fairness_window() {
        let pool = pool_of(3);
        let picks = pick_ids(&pool, 10);
        for id in 0..3 {
            let count = picks.iter().filter(|&&p| p == id).count();
            // 10 picks over 3 backends: each seen 3 or 4 times.
            assert!((3..=4).contains(&count), "backend {} picked {} times", id, count);
        }
    }

    #[test]
    fn test_single_backend_pool() {
        let pool = pool_of(1);
        let none = HashSet::new();
        assert_eq!(pool.pick(&none).unwrap().worker_id, 0);
        assert_eq!(pool.pick(&none).unwrap().worker_id, 0);

        let backend = pool.pick(&none).unwrap();
        pool.mark_failure(&backend);
        assert!(pool.pick(&none).is_none());
    }

    #[test]
    fn test_add_is_deduplicated_by_worker_id() {
        let pool = pool_of(2);
        pool.add(1, endpoint(29999));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_remove_then_add_restores_logical_state() {
        let pool = pool_of(2);
        pool.remove(0);
        assert_eq!(pool.len(), 1);
        assert_eq!(pick_ids(&pool, 2), vec![1, 1]);

        pool.add(0, endpoint(19050));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_removed_backend_is_never_picked() {
        let pool = pool_of(3);
        pool.remove(1);
        let picks = pick_ids(&pool, 8);
        assert!(picks.iter().all(|&id| id != 1));
    }

    #[test]
    fn test_cooldown_skips_backend_without_disturbing_rotation() {
        let pool = pool_of(3);
        let none = HashSet::new();

        let first = pool.pick(&none).unwrap();
        assert_eq!(first.worker_id, 0);
        pool.mark_failure(&first);

        // 0 cools down; rotation continues over 1 and 2.
        assert_eq!(pick_ids(&pool, 4), vec![1, 2, 1, 2]);
        assert_eq!(pool.eligible_count(), 2);
    }

    #[test]
    fn test_mark_success_clears_cooldown_and_streak() {
        let pool = pool_of(1);
        let backend = pool.pick(&HashSet::new()).unwrap();

        pool.mark_failure(&backend);
        pool.mark_failure(&backend);
        assert_eq!(backend.consecutive_failures(), 2);
        assert!(pool.pick(&HashSet::new()).is_none());

        pool.mark_success(&backend);
        assert_eq!(backend.consecutive_failures(), 0);
        assert_eq!(backend.failure_count(), 2);
        assert_eq!(backend.success_count(), 1);
        assert!(pool.pick(&HashSet::new()).is_some());
    }

    #[test]
    fn test_exclude_set_prevents_duplicate_retries() {
        let pool = pool_of(3);
        let mut exclude = HashSet::new();
        let mut tried = Vec::new();

        while let Some(backend) = pool.pick(&exclude) {
            assert!(!tried.contains(&backend.worker_id));
            tried.push(backend.worker_id);
            exclude.insert(backend.worker_id);
        }
        assert_eq!(tried.len(), 3);
    }

    #[test]
    fn test_mark_failure_on_removed_backend_is_harmless() {
        let pool = pool_of(2);
        let backend = pool.pick(&HashSet::new()).unwrap();
        pool.remove(backend.worker_id);

        // The in-flight request may still record its outcome.
        pool.mark_failure(&backend);
        assert_eq!(backend.failure_count(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_cooldown_probe_returns_least_recently_failed() {
        let pool = BackendPool::new(Duration::from_secs(30), true);
        pool.add(0, endpoint(19050));
        pool.add(1, endpoint(19051));
        let none = HashSet::new();

        let first = pool.pick(&none).unwrap();
        pool.mark_failure(&first);
        std::thread::sleep(Duration::from_millis(5));
        let second = pool.pick(&none).unwrap();
        assert_ne!(second.worker_id, first.worker_id);
        pool.mark_failure(&second);

        // Both cooling down: probe policy yields the one that failed first.
        let probe = pool.pick(&none).unwrap();
        assert_eq!(probe.worker_id, first.worker_id);
    }

    #[test]
    fn test_cooldown_probe_respects_exclude() {
        let pool = BackendPool::new(Duration::from_secs(30), true);
        pool.add(0, endpoint(19050));
        let backend = pool.pick(&HashSet::new()).unwrap();
        pool.mark_failure(&backend);

        let mut exclude = HashSet::new();
        exclude.insert(0);
        assert!(pool.pick(&exclude).is_none());
    }

    #[test]
    fn test_stats_reflect_counters() {
        let pool = pool_of(2);
        let backend = pool.pick(&HashSet::new()).unwrap();
        pool.mark_failure(&backend);

        let stats = pool.stats();
        assert_eq!(stats.len(), 2);
        let failed = stats.iter().find(|s| s.worker_id == backend.worker_id).unwrap();
        assert_eq!(failed.failure_count, 1);
        assert!(failed.cooldown_remaining_ms > 0);
    }
}
