//! Ref-counted per-pod locks.
//!
//! Lifecycle operations on the same pod must not interleave, while distinct
//! pods proceed in parallel. Each pod gets its own async mutex, handed out
//! through a ref-counted table: `acquire` inserts or bumps the entry under
//! the table lock, then awaits the per-pod mutex; dropping the guard releases
//! the mutex and evicts the entry when it was the last user. A balanced
//! acquire/release sequence therefore leaves no entry behind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct LockEntry {
    lock: Arc<AsyncMutex<()>>,
    refcount: usize,
}

#[derive(Default)]
struct Table {
    pods: StdMutex<HashMap<String, LockEntry>>,
}

impl Table {
    fn pods(&self) -> std::sync::MutexGuard<'_, HashMap<String, LockEntry>> {
        match self.pods.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The per-pod lock table.
#[derive(Default)]
pub struct PodLockTable {
    table: Arc<Table>,
}

impl PodLockTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for `pod_id`, waiting if another operation holds it.
    ///
    /// The returned guard releases on drop. The refcount is bumped before
    /// awaiting so a concurrent release cannot evict the entry out from
    /// under a waiter; the bump is owned by the guard from the start, so a
    /// caller cancelled mid-wait still undoes it.
    pub async fn acquire(&self, pod_id: &str) -> PodLockGuard {
        let lock = {
            let mut pods = self.table.pods();
            let entry = pods.entry(pod_id.to_string()).or_insert_with(|| LockEntry {
                lock: Arc::new(AsyncMutex::new(())),
                refcount: 0,
            });
            entry.refcount += 1;
            Arc::clone(&entry.lock)
        };

        let mut guard = PodLockGuard {
            table: Arc::clone(&self.table),
            pod_id: pod_id.to_string(),
            guard: None,
        };
        guard.guard = Some(lock.lock_owned().await);
        guard
    }

    /// Number of pods currently holding or waiting on a lock.
    pub fn len(&self) -> usize {
        self.table.pods().len()
    }

    /// True when no pod holds or waits on a lock.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds one pod's lock; dropping it releases the lock and evicts the table
/// entry when this was the last user.
pub struct PodLockGuard {
    table: Arc<Table>,
    pod_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PodLockGuard {
    fn drop(&mut self) {
        // Release the per-pod mutex before touching the table so a waiter
        // blocked in acquire() can proceed as soon as the table lock frees.
        self.guard.take();

        let mut pods = self.table.pods();
        if let Some(entry) = pods.get_mut(&self.pod_id) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                pods.remove(&self.pod_id);
            }
        }
    }
}
