//! In-memory lock manager for testing.
//!
//! Uses atomic spinlocks and is NOT multiprocess-safe. Only
//! [`FileLockManager`](super::FileLockManager) is safe to use across
//! separate `jailbox-host` processes sharing a home directory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use jailbox_shared::JailboxResult;

use super::{lock_exhausted, lock_invalid, lock_not_allocated};
use super::{LockId, LockManager, Locker};

pub struct InMemoryLockManager {
    locks: Vec<Arc<InMemoryLock>>,
    num_locks: u32,
    alloc_lock: Mutex<()>,
}

struct InMemoryLock {
    id: LockId,
    locked: AtomicBool,
    allocated: AtomicBool,
}

impl InMemoryLockManager {
    /// # Panics
    ///
    /// Panics if `num_locks` is 0.
    pub fn new(num_locks: u32) -> Self {
        assert!(num_locks > 0, "must provide a non-zero number of locks");

        let locks = (0..num_locks)
            .map(|i| {
                Arc::new(InMemoryLock {
                    id: LockId(i),
                    locked: AtomicBool::new(false),
                    allocated: AtomicBool::new(false),
                })
            })
            .collect();

        Self {
            locks,
            num_locks,
            alloc_lock: Mutex::new(()),
        }
    }
}

impl LockManager for InMemoryLockManager {
    fn allocate(&self) -> JailboxResult<LockId> {
        let _guard = self.alloc_lock.lock().unwrap();

        for lock in &self.locks {
            if !lock.allocated.load(Ordering::SeqCst) {
                lock.allocated.store(true, Ordering::SeqCst);
                return Ok(lock.id);
            }
        }

        Err(lock_exhausted())
    }

    fn retrieve(&self, id: LockId) -> JailboxResult<Arc<dyn Locker>> {
        if id.0 >= self.num_locks {
            return Err(lock_invalid(id, self.num_locks));
        }

        Ok(Arc::new(InMemoryLocker {
            lock: self.locks[id.0 as usize].clone(),
        }))
    }

    fn free(&self, id: LockId) -> JailboxResult<()> {
        if id.0 >= self.num_locks {
            return Err(lock_invalid(id, self.num_locks));
        }

        let lock = &self.locks[id.0 as usize];
        if !lock.allocated.swap(false, Ordering::SeqCst) {
            return Err(lock_not_allocated(id));
        }

        Ok(())
    }
}

struct InMemoryLocker {
    lock: Arc<InMemoryLock>,
}

impl Locker for InMemoryLocker {
    fn id(&self) -> LockId {
        self.lock.id
    }

    fn lock(&self) {
        while self
            .lock
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::thread::yield_now();
        }
    }

    fn unlock(&self) {
        self.lock.locked.store(false, Ordering::Release);
    }

    fn try_lock(&self) -> bool {
        self.lock
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_reuses_ids() {
        let manager = InMemoryLockManager::new(4);

        let id1 = manager.allocate().unwrap();
        let id2 = manager.allocate().unwrap();
        let _id3 = manager.allocate().unwrap();
        let _id4 = manager.allocate().unwrap();

        assert!(manager.allocate().is_err());

        manager.free(id2).unwrap();
        let id5 = manager.allocate().unwrap();
        assert_eq!(id5, id2);

        manager.free(id1).unwrap();
    }

    #[test]
    fn lock_unlock_round_trips() {
        let manager = InMemoryLockManager::new(4);
        let id = manager.allocate().unwrap();
        let lock = manager.retrieve(id).unwrap();

        lock.lock();
        lock.unlock();

        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn try_lock_fails_under_contention() {
        let manager = Arc::new(InMemoryLockManager::new(4));
        let id = manager.allocate().unwrap();
        let lock = manager.retrieve(id).unwrap();

        lock.lock();

        let lock2 = manager.retrieve(id).unwrap();
        assert!(!lock2.try_lock());

        lock.unlock();
        assert!(lock2.try_lock());
        lock2.unlock();
    }

    #[test]
    fn free_unallocated_lock_errors() {
        let manager = InMemoryLockManager::new(2);
        assert!(manager.free(LockId(0)).is_err());
    }
}
