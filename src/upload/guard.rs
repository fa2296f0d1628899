//! Per-upload concurrency guard
//!
//! At most one mutating operation runs per upload ID. Each ID gets its own
//! async mutex, created lazily; the shared map is only locked for the lookup,
//! so uploads with different IDs never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Held while a mutating operation runs; released on drop
pub type UploadLock = OwnedMutexGuard<()>;

/// Map from upload ID to its mutex
#[derive(Default)]
pub struct ConcurrencyGuard {
    locks: Mutex<HashMap<Uuid, Weak<tokio::sync::Mutex<()>>>>,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    ///
    /// The returned lock owns its mutex, so it stays valid across awaits and
    /// is released on every exit path, including a dropped request future.
    pub async fn acquire(&self, id: Uuid) -> UploadLock {
        let mutex = {
            let mut locks = self.locks.lock();
            match locks.get(&id).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    // Nobody holds a reference to dead entries any more
                    locks.retain(|_, weak| weak.strong_count() > 0);

                    let mutex = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(id, Arc::downgrade(&mutex));
                    mutex
                }
            }
        };

        mutex.lock_owned().await
    }

    /// Drop the entry for `id` once nobody holds or waits on it.
    ///
    /// Holders and waiters keep their own reference, so this never breaks
    /// exclusion for an operation already in flight.
    pub fn forget(&self, id: Uuid) {
        let mut locks = self.locks.lock();
        if locks.get(&id).map_or(false, |weak| weak.strong_count() == 0) {
            locks.remove(&id);
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_id_is_serialized() {
        let guard = Arc::new(ConcurrencyGuard::new());
        let id = Uuid::new_v4();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = guard.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                tokio::spawn(async move {
                    let _lock = guard.acquire(id).await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_ids_run_in_parallel() {
        let guard = ConcurrencyGuard::new();
        let _a = guard.acquire(Uuid::new_v4()).await;

        // Would deadlock if the guard were global
        let b = tokio::time::timeout(Duration::from_secs(1), guard.acquire(Uuid::new_v4())).await;
        assert!(b.is_ok());
        assert_eq!(guard.len(), 2);
    }

    #[tokio::test]
    async fn test_entries_are_pruned() {
        let guard = ConcurrencyGuard::new();
        let id = Uuid::new_v4();

        let lock = guard.acquire(id).await;
        guard.forget(id);
        assert_eq!(guard.len(), 1);

        drop(lock);
        assert!(guard.is_empty());
        guard.forget(id);
        assert!(guard.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_lock_released_when_task_cancelled() {
        let guard = Arc::new(ConcurrencyGuard::new());
        let id = Uuid::new_v4();

        let holder = {
            let guard = guard.clone();
            tokio::spawn(async move {
                let _lock = guard.acquire(id).await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        holder.abort();
        let _ = holder.await;

        let relock = tokio::time::timeout(Duration::from_secs(1), guard.acquire(id)).await;
        assert!(relock.is_ok());
    }
}
