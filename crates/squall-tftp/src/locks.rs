//! Named-resource mutual exclusion for concurrent transfers.
//!
//! One entry per distinct filename ever requested; entries are created
//! lazily and never removed, so the table is capacity-bounded and a new
//! name past capacity fails with `ResourceExhausted`. All transfers that
//! touch the same filename serialize through its mutex regardless of
//! direction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{Result, TftpError};

/// Exclusive ownership of one filename for the lifetime of the guard.
pub struct LockHandle {
    filename: String,
    _guard: OwnedMutexGuard<()>,
}

impl LockHandle {
    pub fn filename(&self) -> &str {
        &self.filename
    }
}

pub struct LockRegistry {
    table: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    capacity: usize,
}

impl LockRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Block the calling task until the named file is exclusively owned.
    ///
    /// The table mutex is held only for the lookup/insert; waiting for
    /// the per-file mutex happens outside it so contended files do not
    /// stall registration of unrelated names.
    pub async fn acquire(&self, filename: &str) -> Result<LockHandle> {
        let entry = {
            let mut table = self.table.lock().expect("lock table poisoned");
            match table.get(filename) {
                Some(entry) => Arc::clone(entry),
                None => {
                    if table.len() >= self.capacity {
                        return Err(TftpError::ResourceExhausted(format!(
                            "file lock table full ({} entries)",
                            self.capacity
                        )));
                    }
                    let entry = Arc::new(AsyncMutex::new(()));
                    table.insert(filename.to_string(), Arc::clone(&entry));
                    entry
                }
            }
        };

        let guard = entry.lock_owned().await;
        debug!(filename, "file lock acquired");
        Ok(LockHandle {
            filename: filename.to_string(),
            _guard: guard,
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.lock().expect("lock table poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn same_name_is_exclusive() {
        let registry = LockRegistry::new(10);
        let held = registry.acquire("a.bin").await.unwrap();

        let blocked = timeout(Duration::from_millis(50), registry.acquire("a.bin")).await;
        assert!(blocked.is_err(), "second acquire should block");

        drop(held);
        let reacquired = timeout(Duration::from_millis(500), registry.acquire("a.bin")).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn different_names_do_not_block() {
        let registry = LockRegistry::new(10);
        let _a = registry.acquire("a.bin").await.unwrap();
        let b = timeout(Duration::from_millis(100), registry.acquire("b.bin")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn entries_are_reused_not_duplicated() {
        let registry = LockRegistry::new(10);
        drop(registry.acquire("a.bin").await.unwrap());
        drop(registry.acquire("a.bin").await.unwrap());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn new_name_past_capacity_is_resource_exhausted() {
        let registry = LockRegistry::new(2);
        drop(registry.acquire("a").await.unwrap());
        drop(registry.acquire("b").await.unwrap());

        match registry.acquire("c").await {
            Err(TftpError::ResourceExhausted(_)) => {}
            other => panic!("expected ResourceExhausted, got {:?}", other.map(|h| h.filename().to_string())),
        }

        // Known names still work at capacity.
        assert!(registry.acquire("a").await.is_ok());
    }

    #[tokio::test]
    async fn serializes_concurrent_holders() {
        let registry = Arc::new(LockRegistry::new(10));
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let counter = Arc::clone(&counter);
            tasks.push(tokio::spawn(async move {
                let _handle = registry.acquire("shared.bin").await.unwrap();
                let inside = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                assert_eq!(inside, 0, "critical sections overlapped");
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }
}
