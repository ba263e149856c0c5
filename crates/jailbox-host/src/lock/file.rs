//! File-based lock manager for cross-process locking.
//!
//! Locks are files in a directory; file existence tracks allocation and
//! flock(2) provides the actual mutual exclusion. Multiprocess-safe, so
//! this is the manager `jailbox-host` uses outside of tests.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use jailbox_shared::{JailboxError, JailboxResult};

use super::lock_not_allocated;
use super::{LockId, LockManager, Locker};

pub struct FileLockManager {
    lock_dir: PathBuf,
    allocated: RwLock<HashSet<LockId>>,
    alloc_lock: Mutex<()>,
}

impl FileLockManager {
    /// Creates `lock_dir` if it doesn't exist and scans it for lock files
    /// left behind by a previous run (so a restarted Host doesn't reuse an
    /// id still held by a live worker).
    pub fn new<P: AsRef<Path>>(lock_dir: P) -> JailboxResult<Self> {
        let lock_dir = lock_dir.as_ref().to_path_buf();

        fs::create_dir_all(&lock_dir).map_err(|e| {
            JailboxError::Config(format!(
                "failed to create lock directory {}: {e}",
                lock_dir.display()
            ))
        })?;

        let mut allocated = HashSet::new();
        if let Ok(entries) = fs::read_dir(&lock_dir) {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str()
                    && let Ok(id) = name.parse::<u32>()
                {
                    allocated.insert(LockId(id));
                }
            }
        }

        Ok(Self {
            lock_dir,
            allocated: RwLock::new(allocated),
            alloc_lock: Mutex::new(()),
        })
    }

    fn lock_path(&self, id: LockId) -> PathBuf {
        self.lock_dir.join(id.0.to_string())
    }

    fn next_available_id(&self) -> LockId {
        let allocated = self.allocated.read().unwrap();
        let mut id = 0u32;
        while allocated.contains(&LockId(id)) {
            id = id.checked_add(1).expect("lock ID overflow");
        }
        LockId(id)
    }
}

impl LockManager for FileLockManager {
    fn allocate(&self) -> JailboxResult<LockId> {
        let _guard = self.alloc_lock.lock().unwrap();

        let id = self.next_available_id();
        let path = self.lock_path(id);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                JailboxError::Internal(format!(
                    "failed to create lock file {}: {e}",
                    path.display()
                ))
            })?;
        drop(file);

        self.allocated.write().unwrap().insert(id);
        Ok(id)
    }

    fn retrieve(&self, id: LockId) -> JailboxResult<Arc<dyn Locker>> {
        let path = self.lock_path(id);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    lock_not_allocated(id)
                } else {
                    JailboxError::Internal(format!(
                        "failed to open lock file {}: {e}",
                        path.display()
                    ))
                }
            })?;

        Ok(Arc::new(FileLock { id, file }))
    }

    fn free(&self, id: LockId) -> JailboxResult<()> {
        let path = self.lock_path(id);

        {
            let mut allocated = self.allocated.write().unwrap();
            if !allocated.remove(&id) {
                return Err(lock_not_allocated(id));
            }
        }

        fs::remove_file(&path).map_err(|e| {
            JailboxError::Internal(format!("failed to remove lock file {}: {e}", path.display()))
        })?;

        Ok(())
    }
}

struct FileLock {
    id: LockId,
    file: File,
}

impl Locker for FileLock {
    fn id(&self) -> LockId {
        self.id
    }

    fn lock(&self) {
        let fd = self.file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
        if result != 0 {
            panic!("flock(LOCK_EX) failed: {}", std::io::Error::last_os_error());
        }
    }

    fn unlock(&self) {
        let fd = self.file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_UN) };
        if result != 0 {
            panic!("flock(LOCK_UN) failed: {}", std::io::Error::last_os_error());
        }
    }

    fn try_lock(&self) -> bool {
        let fd = self.file.as_raw_fd();
        unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) == 0 }
    }
}

unsafe impl Send for FileLock {}
unsafe impl Sync for FileLock {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_manager() -> (FileLockManager, TempDir) {
        let temp_dir = TempDir::new().expect("create temp dir");
        let lock_dir = temp_dir.path().join("locks");
        let manager = FileLockManager::new(&lock_dir).expect("create manager");
        (manager, temp_dir)
    }

    #[test]
    fn allocate_creates_file() {
        let (manager, _temp) = create_test_manager();
        let id = manager.allocate().unwrap();
        assert!(manager.lock_path(id).exists());
    }

    #[test]
    fn free_removes_file() {
        let (manager, _temp) = create_test_manager();
        let id = manager.allocate().unwrap();
        let path = manager.lock_path(id);

        manager.free(id).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn lock_unlock_round_trips() {
        let (manager, _temp) = create_test_manager();
        let id = manager.allocate().unwrap();
        let lock = manager.retrieve(id).unwrap();

        lock.lock();
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn try_lock_fails_when_held() {
        let (manager, _temp) = create_test_manager();
        let id = manager.allocate().unwrap();
        let lock1 = manager.retrieve(id).unwrap();
        let lock2 = manager.retrieve(id).unwrap();

        lock1.lock();
        assert!(!lock2.try_lock());
        lock1.unlock();
        assert!(lock2.try_lock());
        lock2.unlock();
    }

    #[test]
    fn reopen_manager_sees_existing_locks() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let lock_dir = temp_dir.path().join("locks");

        let id1;
        {
            let manager = FileLockManager::new(&lock_dir).unwrap();
            id1 = manager.allocate().unwrap();
        }

        let manager = FileLockManager::new(&lock_dir).unwrap();
        assert!(manager.retrieve(id1).is_ok());
        let id2 = manager.allocate().unwrap();
        assert_ne!(id1, id2);
    }
}
