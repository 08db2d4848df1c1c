//! flock(2) locks backed by one file per slot.
//!
//! A slot is allocated exactly when `<dir>/<id>` exists. Files are claimed
//! with `O_EXCL`, so two processes can never allocate the same slot.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use podlite_shared::errors::{PodliteError, PodliteResult};

use super::{LockId, LockManager, Locker};
use super::{exhausted, not_allocated, out_of_range, taken};

pub struct FileLockManager {
    dir: PathBuf,
    limit: Option<u32>,
}

impl FileLockManager {
    /// Use `dir` for lock files, creating it if needed. With a `limit`,
    /// only slots below it are handed out.
    pub fn new(dir: impl Into<PathBuf>, limit: Option<u32>) -> PodliteResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            PodliteError::Storage(format!("creating lock directory {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir, limit })
    }

    fn path(&self, id: LockId) -> PathBuf {
        self.dir.join(id.0.to_string())
    }

    fn check_range(&self, id: LockId) -> PodliteResult<()> {
        match self.limit {
            Some(limit) if id.0 >= limit => Err(out_of_range(id, limit)),
            _ => Ok(()),
        }
    }

    /// Create the slot's file. `Ok(None)` means another allocation owns it.
    fn claim(&self, id: LockId) -> PodliteResult<Option<File>> {
        let path = self.path(id);
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(PodliteError::Storage(format!(
                "creating lock file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// IDs of every allocated slot.
    fn allocated(&self) -> Vec<u32> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .collect()
    }
}

impl LockManager for FileLockManager {
    fn allocate(&self) -> PodliteResult<LockId> {
        let end = self.limit.unwrap_or(u32::MAX);
        for n in 0..end {
            let id = LockId(n);
            if self.claim(id)?.is_some() {
                tracing::trace!(lock_id = %id, "allocated lock");
                return Ok(id);
            }
        }
        Err(exhausted(self.limit))
    }

    fn retrieve(&self, id: LockId) -> PodliteResult<Arc<dyn Locker>> {
        let path = self.path(id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => not_allocated(id),
                _ => PodliteError::Storage(format!("opening lock file {}: {}", path.display(), e)),
            })?;
        Ok(Arc::new(FileLock { id, file }))
    }

    fn reserve(&self, id: LockId) -> PodliteResult<()> {
        self.check_range(id)?;
        match self.claim(id)? {
            Some(_) => Ok(()),
            None => Err(taken(id)),
        }
    }

    fn free(&self, id: LockId) -> PodliteResult<()> {
        let path = self.path(id);
        fs::remove_file(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => not_allocated(id),
            _ => PodliteError::Storage(format!("removing lock file {}: {}", path.display(), e)),
        })
    }

    fn clear_all_locks(&self) -> PodliteResult<()> {
        for n in self.allocated() {
            let path = self.path(LockId(n));
            if let Err(e) = fs::remove_file(&path)
                && e.kind() != ErrorKind::NotFound
            {
                return Err(PodliteError::Storage(format!(
                    "removing lock file {}: {}",
                    path.display(),
                    e
                )));
            }
        }
        Ok(())
    }

    fn available(&self) -> Option<u32> {
        let limit = self.limit?;
        let used = self.allocated().into_iter().filter(|n| *n < limit).count() as u32;
        Some(limit.saturating_sub(used))
    }
}

pub(super) fn flock(file: &File, op: libc::c_int) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: `file` keeps the descriptor open for the duration of the call.
    if unsafe { libc::flock(file.as_raw_fd(), op) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// One open description of a slot's file. Separate handles exclude each
/// other even inside one process.
struct FileLock {
    id: LockId,
    file: File,
}

impl Locker for FileLock {
    fn id(&self) -> LockId {
        self.id
    }

    fn lock(&self) {
        if let Err(e) = flock(&self.file, libc::LOCK_EX) {
            panic!("locking {}: {}", self.id, e);
        }
    }

    fn unlock(&self) {
        if let Err(e) = flock(&self.file, libc::LOCK_UN) {
            panic!("unlocking {}: {}", self.id, e);
        }
    }

    fn try_lock(&self) -> bool {
        flock(&self.file, libc::LOCK_EX | libc::LOCK_NB).is_ok()
    }
}

impl std::fmt::Debug for FileLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLockManager")
            .field("dir", &self.dir)
            .field("limit", &self.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(limit: Option<u32>) -> (tempfile::TempDir, FileLockManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = FileLockManager::new(dir.path().join("locks"), limit).unwrap();
        (dir, manager)
    }

    #[test]
    fn allocation_is_visible_to_other_managers() {
        let (_dir, first) = manager(None);
        let second = FileLockManager::new(first.dir.clone(), None).unwrap();

        let a = first.allocate().unwrap();
        let b = second.allocate().unwrap();
        assert_ne!(a, b);
        assert!(second.retrieve(a).is_ok());

        second.free(a).unwrap();
        assert!(matches!(first.retrieve(a), Err(e) if e.is_not_found()));
    }

    #[test]
    fn limit_bounds_allocation() {
        let (_dir, manager) = manager(Some(2));
        assert_eq!(manager.available(), Some(2));
        manager.allocate().unwrap();
        manager.allocate().unwrap();
        assert_eq!(manager.available(), Some(0));
        assert!(manager.allocate().is_err());
        assert!(matches!(
            manager.reserve(LockId(5)),
            Err(PodliteError::InvalidArgument(_))
        ));
    }

    #[test]
    fn clear_keeps_unrelated_files() {
        let (_dir, manager) = manager(None);
        manager.allocate().unwrap();
        fs::write(manager.dir.join("README"), "not a lock").unwrap();

        manager.clear_all_locks().unwrap();
        assert!(manager.allocated().is_empty());
        assert!(manager.dir.join("README").exists());
    }

    #[test]
    fn handles_in_other_threads_exclude_each_other() {
        let (_dir, manager) = manager(None);
        let id = manager.allocate().unwrap();
        let counter = Arc::new(parking_lot::Mutex::new(0u32));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = manager.retrieve(id).unwrap();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        lock.lock();
                        let seen = *counter.lock();
                        std::thread::yield_now();
                        *counter.lock() = seen + 1;
                        lock.unlock();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*counter.lock(), 200);
    }
}
