use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

type Slot = Arc<AsyncMutex<()>>;

/// Process-wide registry of named async mutexes.
///
/// Waiters on one name are served in FIFO order. Locks are not reentrant:
/// acquiring a name already held by the same task waits forever. A slot
/// lives only while someone holds or waits on it.
#[derive(Default)]
pub struct ResourceLocks {
    slots: Mutex<HashMap<String, Slot>>,
}

impl ResourceLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn acquire(self: &Arc<Self>, name: impl Into<String>) -> LockGuard {
        let name = name.into();
        let held = vec![self.lock_one(name).await];
        LockGuard {
            locks: Arc::clone(self),
            held,
        }
    }

    /// Acquires every name in sorted order so overlapping sets cannot
    /// deadlock each other.
    pub async fn acquire_all(self: &Arc<Self>, names: &[String]) -> LockGuard {
        let mut sorted = names.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut held = Vec::with_capacity(sorted.len());
        for name in sorted {
            held.push(self.lock_one(name).await);
        }
        LockGuard {
            locks: Arc::clone(self),
            held,
        }
    }

    async fn lock_one(&self, name: String) -> HeldLock {
        let slot = {
            let mut slots = self.slots.lock();
            prune(&mut slots);
            Arc::clone(slots.entry(name.clone()).or_default())
        };
        let guard = Arc::clone(&slot).lock_owned().await;
        trace!(lock = %name, "lock acquired");
        HeldLock {
            name,
            slot,
            guard: Some(guard),
        }
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.slots
            .lock()
            .get(name)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Names currently held or awaited.
    pub fn active(&self) -> usize {
        let mut slots = self.slots.lock();
        prune(&mut slots);
        slots.len()
    }
}

/// Drops slots only the map still owns. Guards clean up after themselves,
/// but a waiter cancelled after the last release leaves its slot behind.
fn prune(slots: &mut HashMap<String, Slot>) {
    slots.retain(|_, slot| Arc::strong_count(slot) > 1);
}

struct HeldLock {
    name: String,
    slot: Slot,
    guard: Option<OwnedMutexGuard<()>>,
}

/// Releases its locks on drop, on every exit path of the holder.
pub struct LockGuard {
    locks: Arc<ResourceLocks>,
    held: Vec<HeldLock>,
}

impl LockGuard {
    pub fn names(&self) -> Vec<&str> {
        self.held.iter().map(|h| h.name.as_str()).collect()
    }

    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut slots = self.locks.slots.lock();
        for mut held in self.held.drain(..).rev() {
            held.guard.take();
            // the map and `held.slot` are the only owners left
            if Arc::strong_count(&held.slot) == 2 {
                slots.remove(&held.name);
            }
            trace!(lock = %held.name, "lock released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ResourceLocks;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn second_holder_waits_for_release() {
        let locks = ResourceLocks::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let guard = locks.acquire("db:k").await;

        let task = {
            let locks = Arc::clone(&locks);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _guard = locks.acquire("db:k").await;
                order.lock().await.push("second");
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        order.lock().await.push("first");
        guard.release();
        task.await.expect("join");

        assert_eq!(*order.lock().await, vec!["first", "second"]);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn independent_names_do_not_block() {
        let locks = ResourceLocks::new();
        let _a = locks.acquire("db:a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("db:b"))
            .await
            .expect("b must not wait on a");
        assert!(locks.is_locked("db:a"));
        assert!(locks.is_locked("db:b"));
        drop(b);
        assert!(!locks.is_locked("db:b"));
    }

    #[tokio::test]
    async fn lock_is_released_when_holder_errors() {
        let locks = ResourceLocks::new();
        async fn failing(locks: &Arc<ResourceLocks>) -> Result<(), &'static str> {
            let _guard = locks.acquire("db:x").await;
            Err("boom")
        }
        assert!(failing(&locks).await.is_err());
        assert!(!locks.is_locked("db:x"));
    }

    #[tokio::test]
    async fn acquire_all_sorts_and_dedups() {
        let locks = ResourceLocks::new();
        let guard = locks
            .acquire_all(&["b".to_string(), "a".to_string(), "b".to_string()])
            .await;
        assert_eq!(guard.names(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_leaves_no_slot_behind() {
        let locks = ResourceLocks::new();
        let guard = locks.acquire("db:k").await;
        let mut waiter = Box::pin(locks.acquire("db:k"));
        assert!(
            tokio::time::timeout(Duration::from_millis(10), &mut waiter)
                .await
                .is_err()
        );
        guard.release();
        drop(waiter);

        assert_eq!(locks.active(), 0);
        assert!(!locks.is_locked("db:k"));
        let again = tokio::time::timeout(Duration::from_millis(10), locks.acquire("db:k"))
            .await
            .expect("free after cancel");
        assert_eq!(locks.active(), 1);
        drop(again);
        assert_eq!(locks.active(), 0);
    }
}
