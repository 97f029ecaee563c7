//! Named task accounting for the shutdown report.
//!
//! Tokio tasks cannot be enumerated from outside, so every long-lived
//! application task registers itself here at spawn and deregisters on exit
//! (via a drop guard, so panics deregister too). At shutdown the supervisor
//! reports whatever is still outstanding — the leak-diagnosis equivalent of
//! a runtime stack dump, scoped to application tasks by construction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct Inner {
    live: HashMap<u64, &'static str>,
    next_id: u64,
    total_spawned: u64,
}

/// Registry of live application tasks.
#[derive(Clone)]
pub struct TaskGroup {
    inner: Arc<Mutex<Inner>>,
}

/// Deregisters its task when dropped.
pub struct TaskGuard {
    inner: Arc<Mutex<Inner>>,
    id: u64,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.inner.lock().unwrap().live.remove(&self.id);
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                live: HashMap::new(),
                next_id: 0,
                total_spawned: 0,
            })),
        }
    }

    /// Register a task by name; hold the guard for the task's lifetime.
    pub fn register(&self, name: &'static str) -> TaskGuard {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.total_spawned += 1;
        inner.live.insert(id, name);
        TaskGuard {
            inner: self.inner.clone(),
            id,
        }
    }

    /// Spawn a named future whose registration is tied to its lifetime.
    pub fn spawn<F>(&self, name: &'static str, fut: F) -> tokio::task::JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let guard = self.register(name);
        tokio::spawn(async move {
            let _guard = guard;
            fut.await;
        })
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    pub fn total_spawned(&self) -> u64 {
        self.inner.lock().unwrap().total_spawned
    }

    /// Names of tasks still live, sorted for stable reporting.
    pub fn outstanding(&self) -> Vec<&'static str> {
        let inner = self.inner.lock().unwrap();
        let mut names: Vec<_> = inner.live.values().copied().collect();
        names.sort_unstable();
        names
    }

    /// Log the end-of-life report: totals plus any stragglers.
    pub fn report(&self) {
        let outstanding = self.outstanding();
        if outstanding.is_empty() {
            tracing::info!(
                spawned = self.total_spawned(),
                "all application tasks finished"
            );
        } else {
            tracing::warn!(
                spawned = self.total_spawned(),
                outstanding = outstanding.len(),
                names = ?outstanding,
                "application tasks still running at shutdown"
            );
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}
