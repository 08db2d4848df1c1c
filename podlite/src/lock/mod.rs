//! Entity locks.
//!
//! Containers, pods and volumes each carry a [`LockId`] in their stored
//! configuration. Every process that opens the same home directory maps
//! that ID to the same lock, so holding it excludes other processes too.
//!
//! Acquire in a fixed order: pod, then container, then volume.

mod file;
mod memory;
mod path;

pub use file::FileLockManager;
pub use memory::InMemoryLockManager;
pub use path::PathLock;

use std::sync::Arc;

use podlite_shared::errors::{PodliteError, PodliteResult};

/// Number of a lock slot, persisted in entity configuration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct LockId(pub u32);

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out lock slots and opens them.
///
/// Slots are allocated when an entity is created and freed when it is
/// removed. After a reboot the allocation table is stale: callers wipe it
/// with [`clear_all_locks`](LockManager::clear_all_locks) and then
/// [`reserve`](LockManager::reserve) the slot of every stored entity.
pub trait LockManager: Send + Sync {
    /// Allocate the lowest free slot.
    fn allocate(&self) -> PodliteResult<LockId>;

    /// Open the lock in slot `id`. The slot must be allocated.
    fn retrieve(&self, id: LockId) -> PodliteResult<Arc<dyn Locker>>;

    /// Mark a specific slot as allocated. Fails if it already is.
    fn reserve(&self, id: LockId) -> PodliteResult<()>;

    fn free(&self, id: LockId) -> PodliteResult<()>;

    /// Forget every allocation. Only safe while no other process holds a lock.
    fn clear_all_locks(&self) -> PodliteResult<()>;

    /// Free slots left, `None` when the manager has no limit.
    fn available(&self) -> Option<u32>;
}

/// An exclusive lock shared by every handle with the same [`LockId`].
pub trait Locker: Send + Sync {
    fn id(&self) -> LockId;

    /// Block until the lock is held.
    ///
    /// # Panics
    ///
    /// Panics when the underlying lock primitive reports an error.
    fn lock(&self);

    fn unlock(&self);

    /// Take the lock if it is free.
    fn try_lock(&self) -> bool;
}

/// Holds a [`Locker`] until dropped.
pub struct LockGuard<'a> {
    lock: &'a dyn Locker,
}

impl<'a> LockGuard<'a> {
    pub fn new(lock: &'a dyn Locker) -> Self {
        lock.lock();
        Self { lock }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

fn exhausted(limit: Option<u32>) -> PodliteError {
    match limit {
        Some(n) => PodliteError::Internal(format!("all {} locks are allocated", n)),
        None => PodliteError::Internal("no lock IDs left".to_string()),
    }
}

fn out_of_range(id: LockId, limit: u32) -> PodliteError {
    PodliteError::InvalidArgument(format!("lock {} is out of range (limit {})", id, limit))
}

fn taken(id: LockId) -> PodliteError {
    PodliteError::InvalidState(format!("lock {} is already allocated", id))
}

fn not_allocated(id: LockId) -> PodliteError {
    PodliteError::NotFound(format!("lock {} is not allocated", id))
}
