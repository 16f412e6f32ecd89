//! The core state of the load balancer: per-host worker pools and their
//! round-robin cursors.
//!
//! Every host owns an independent pool guarded by its own lock. The outer
//! map only hands out shared handles to pools, so work on one host never
//! waits on another host's lock.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{endpoint::Worker, metrics::REGISTERED_WORKERS};

#[derive(Debug, Default)]
struct HostPool {
    workers: Vec<Worker>,
    cursor: usize,
}

impl HostPool {
    /// Keeps the cursor inside `[0, len)`, or at 0 for an empty pool.
    fn clamp_cursor(&mut self) {
        if self.cursor >= self.workers.len() {
            self.cursor = 0;
        }
    }
}

/// The worker picked for one dispatch, captured atomically with the
/// cursor position and pool size it was picked at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub worker: Worker,
    pub index: usize,
    pub pool_len: usize,
}

/// A point-in-time view of one host, as reported by `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct HostSnapshot {
    pub host: String,
    pub cursor: usize,
    pub workers: Vec<Worker>,
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    pools: DashMap<String, Arc<Mutex<HostPool>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self, host: &str) -> Option<Arc<Mutex<HostPool>>> {
        self.pools.get(host).map(|entry| entry.value().clone())
    }

    /// Returns the pool for `host`, creating it (and its lock) on first write.
    fn pool_or_create(&self, host: &str) -> Arc<Mutex<HostPool>> {
        if let Some(pool) = self.pool(host) {
            return pool;
        }
        self.pools
            .entry(host.to_string())
            .or_insert_with(|| {
                debug!(host = %host, "Created worker pool");
                Arc::new(Mutex::new(HostPool::default()))
            })
            .value()
            .clone()
    }

    /// Returns the workers registered for `host` in insertion order.
    pub fn get(&self, host: &str) -> Vec<Worker> {
        self.pool(host).map(|pool| pool.lock().workers.clone()).unwrap_or_default()
    }

    /// Number of workers currently registered for `host`.
    pub fn len(&self, host: &str) -> usize {
        self.pool(host).map(|pool| pool.lock().workers.len()).unwrap_or(0)
    }

    /// Appends `worker` to the pool for `host` and returns the new pool size.
    /// Duplicates are accepted.
    pub fn add(&self, host: &str, worker: Worker) -> usize {
        let pool = self.pool_or_create(host);
        let count = {
            let mut pool = pool.lock();
            pool.workers.push(worker);
            pool.workers.len()
        };
        REGISTERED_WORKERS.with_label_values(&[host]).set(count as i64);
        info!(host = %host, workers = count, "Worker added");
        count
    }

    /// Removes the first worker matching `worker` on host, address and port.
    /// Returns the resulting pool size; absent workers are a no-op.
    pub fn remove(&self, worker: &Worker) -> usize {
        let Some(pool) = self.pool(&worker.host) else {
            return 0;
        };
        let (removed, count) = {
            let mut pool = pool.lock();
            let position = pool.workers.iter().position(|w| w.same_endpoint(worker));
            if let Some(index) = position {
                pool.workers.remove(index);
                if index < pool.cursor {
                    pool.cursor -= 1;
                }
                pool.clamp_cursor();
            }
            (position.is_some(), pool.workers.len())
        };
        if removed {
            REGISTERED_WORKERS.with_label_values(&[&worker.host]).set(count as i64);
            info!(host = %worker.host, worker = %worker, workers = count, "Worker removed");
        }
        count
    }

    /// Current rotation cursor for `host` (0 for unknown hosts).
    pub fn current_index(&self, host: &str) -> usize {
        self.pool(host).map(|pool| pool.lock().cursor).unwrap_or(0)
    }

    /// Moves the cursor to the next worker, wrapping at the current pool size.
    /// An empty or unknown pool is left untouched.
    pub fn advance(&self, host: &str) {
        if let Some(pool) = self.pool(host) {
            let mut pool = pool.lock();
            let len = pool.workers.len();
            if len > 0 {
                pool.cursor = (pool.cursor + 1) % len;
            }
        }
    }

    /// Picks the worker at the cursor for `host`, without moving the cursor.
    pub fn select(&self, host: &str) -> Option<Selection> {
        let pool = self.pool(host)?;
        let pool = pool.lock();
        let worker = pool.workers.get(pool.cursor)?.clone();
        Some(Selection { worker, index: pool.cursor, pool_len: pool.workers.len() })
    }

    /// Advances the cursor for a completed dispatch.
    ///
    /// Wraps at the pool size observed when `selection` was taken, then
    /// clamps into the live pool in case it shrank in the meantime.
    pub fn advance_after(&self, host: &str, selection: &Selection) {
        if selection.pool_len == 0 {
            return;
        }
        if let Some(pool) = self.pool(host) {
            let mut pool = pool.lock();
            pool.cursor = (pool.cursor + 1) % selection.pool_len;
            pool.clamp_cursor();
        }
    }

    /// All known hosts with their workers and cursor, sorted by host.
    pub fn snapshot(&self) -> Vec<HostSnapshot> {
        let pools: Vec<(String, Arc<Mutex<HostPool>>)> =
            self.pools.iter().map(|entry| (entry.key().clone(), entry.value().clone())).collect();
        let mut hosts: Vec<HostSnapshot> = pools
            .into_iter()
            .map(|(host, pool)| {
                let pool = pool.lock();
                HostSnapshot { host, cursor: pool.cursor, workers: pool.workers.clone() }
            })
            .collect();
        hosts.sort_by(|a, b| a.host.cmp(&b.host));
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn worker(host: &str, address: &str, port: u16) -> Worker {
        Worker::new(host, address, port)
    }

    fn registry_with(host: &str, count: u16) -> WorkerRegistry {
        let registry = WorkerRegistry::new();
        for i in 0..count {
            registry.add(host, worker(host, &format!("10.0.0.{}", i + 1), 9000));
        }
        registry
    }

    /// Mimics one dispatch: select, then advance.
    fn dispatch(registry: &WorkerRegistry, host: &str) -> Option<Worker> {
        let selection = registry.select(host)?;
        registry.advance_after(host, &selection);
        Some(selection.worker)
    }

    #[test]
    fn test_unknown_host_is_empty() {
        let registry = WorkerRegistry::new();
        assert!(registry.get("nope").is_empty());
        assert_eq!(registry.current_index("nope"), 0);
        assert!(registry.select("nope").is_none());
        registry.advance("nope");
        assert!(registry.snapshot().is_empty(), "Reads must not create pools");
    }

    #[test]
    fn test_add_preserves_insertion_order() {
        let registry = registry_with("svc.local", 3);
        let addresses: Vec<String> =
            registry.get("svc.local").into_iter().map(|w| w.address).collect();
        assert_eq!(addresses, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn test_add_allows_duplicates() {
        let registry = WorkerRegistry::new();
        assert_eq!(registry.add("svc.local", worker("svc.local", "10.0.0.1", 9000)), 1);
        assert_eq!(registry.add("svc.local", worker("svc.local", "10.0.0.1", 9000)), 2);
    }

    #[test]
    fn test_round_robin_visits_each_worker_in_order() {
        let registry = registry_with("svc.local", 3);
        let visited: Vec<String> =
            (0..6).map(|_| dispatch(&registry, "svc.local").unwrap().address).collect();
        assert_eq!(
            visited,
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.1", "10.0.0.2", "10.0.0.3"]
        );
    }

    #[test]
    fn test_advance_wraps() {
        let registry = registry_with("h", 2);
        registry.advance("h");
        assert_eq!(registry.current_index("h"), 1);
        registry.advance("h");
        assert_eq!(registry.current_index("h"), 0);
    }

    #[test]
    fn test_advance_on_empty_pool_is_noop() {
        let registry = registry_with("h", 1);
        registry.remove(&worker("h", "10.0.0.1", 9000));
        registry.advance("h");
        assert_eq!(registry.current_index("h"), 0);
        assert!(registry.select("h").is_none());
    }

    #[test]
    fn test_remove_first_match_only() {
        let registry = WorkerRegistry::new();
        registry.add("h", worker("h", "a", 1));
        registry.add("h", worker("h", "a", 1));
        assert_eq!(registry.remove(&worker("h", "a", 1)), 1);
        assert_eq!(registry.get("h"), vec![worker("h", "a", 1)]);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let registry = registry_with("h", 2);
        assert_eq!(registry.remove(&worker("h", "10.9.9.9", 9000)), 2);
        assert_eq!(registry.remove(&worker("other", "10.0.0.1", 9000)), 0);
        assert_eq!(registry.len("h"), 2);
    }

    #[test]
    fn test_remove_matches_on_port() {
        let registry = registry_with("h", 1);
        assert_eq!(registry.remove(&worker("h", "10.0.0.1", 9001)), 1);
        assert_eq!(registry.remove(&worker("h", "10.0.0.1", 9000)), 0);
    }

    #[test]
    fn test_remove_keeps_cursor_on_next_worker() {
        let registry = registry_with("h", 3);
        registry.advance("h");
        registry.advance("h");
        // Cursor points at 10.0.0.3; removing an earlier worker shifts it down.
        registry.remove(&worker("h", "10.0.0.1", 9000));
        assert_eq!(registry.current_index("h"), 1);
        assert_eq!(registry.select("h").unwrap().worker.address, "10.0.0.3");
    }

    #[test]
    fn test_remove_last_position_wraps_cursor() {
        let registry = registry_with("h", 2);
        registry.advance("h");
        registry.remove(&worker("h", "10.0.0.2", 9000));
        assert_eq!(registry.current_index("h"), 0);
        assert_eq!(registry.select("h").unwrap().worker.address, "10.0.0.1");
    }

    #[test]
    fn test_host_footprint_survives_empty_pool() {
        let registry = registry_with("h", 1);
        registry.remove(&worker("h", "10.0.0.1", 9000));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].workers.is_empty());
        assert_eq!(registry.add("h", worker("h", "10.0.0.7", 9000)), 1);
        assert_eq!(dispatch(&registry, "h").unwrap().address, "10.0.0.7");
    }

    #[test]
    fn test_advance_after_uses_selection_snapshot() {
        let registry = registry_with("h", 3);
        registry.advance("h");
        registry.advance("h");
        let selection = registry.select("h").unwrap();
        assert_eq!(selection.index, 2);
        assert_eq!(selection.pool_len, 3);

        // The pool shrinks while the request is in flight.
        registry.remove(&worker("h", "10.0.0.2", 9000));
        registry.advance_after("h", &selection);
        let cursor = registry.current_index("h");
        assert!(cursor < registry.len("h"), "cursor {} out of range", cursor);
    }

    #[test]
    fn test_advance_after_on_emptied_pool() {
        let registry = registry_with("h", 1);
        let selection = registry.select("h").unwrap();
        registry.remove(&worker("h", "10.0.0.1", 9000));
        registry.advance_after("h", &selection);
        assert_eq!(registry.current_index("h"), 0);
    }

    #[test]
    fn test_hosts_rotate_independently() {
        let registry = registry_with("a", 2);
        registry.add("b", worker("b", "10.1.0.1", 80));
        registry.add("b", worker("b", "10.1.0.2", 80));

        assert_eq!(dispatch(&registry, "a").unwrap().address, "10.0.0.1");
        assert_eq!(dispatch(&registry, "b").unwrap().address, "10.1.0.1");
        assert_eq!(dispatch(&registry, "a").unwrap().address, "10.0.0.2");
        assert_eq!(registry.current_index("b"), 1);
    }

    #[test]
    fn test_concurrent_writes_do_not_disturb_other_hosts() {
        let registry = Arc::new(registry_with("b", 3));
        registry.advance("b");

        let mut handles = vec![];
        for i in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                for j in 0..50u16 {
                    let w = worker("a", &format!("10.2.{}.{}", i, j), 8000 + j);
                    registry.add("a", w.clone());
                    if j % 2 == 0 {
                        registry.remove(&w);
                    }
                    let _ = registry.select("a");
                    registry.advance("a");
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len("a"), 8 * 25);
        assert!(registry.current_index("a") < registry.len("a"));
        assert_eq!(registry.len("b"), 3);
        assert_eq!(registry.current_index("b"), 1);
        let addresses: Vec<String> = registry.get("b").into_iter().map(|w| w.address).collect();
        assert_eq!(addresses, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn test_snapshot_sorted_by_host() {
        let registry = WorkerRegistry::new();
        registry.add("z.local", worker("z.local", "a", 1));
        registry.add("a.local", worker("a.local", "b", 2));
        let hosts: Vec<String> = registry.snapshot().into_iter().map(|h| h.host).collect();
        assert_eq!(hosts, vec!["a.local", "z.local"]);
    }
}
