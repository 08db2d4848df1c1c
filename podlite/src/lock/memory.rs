//! Process-local locks for tests. They do not exclude other processes.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use podlite_shared::errors::PodliteResult;

use super::{LockId, LockManager, Locker};
use super::{exhausted, not_allocated, out_of_range, taken};

/// A fixed table of locks living in this process.
///
/// ```
/// use podlite::lock::{InMemoryLockManager, LockGuard, LockManager};
///
/// let manager = InMemoryLockManager::new(4);
/// let id = manager.allocate().unwrap();
/// let lock = manager.retrieve(id).unwrap();
/// let _held = LockGuard::new(lock.as_ref());
/// ```
pub struct InMemoryLockManager {
    slots: Vec<Arc<Slot>>,
    allocated: Mutex<Vec<bool>>,
}

#[derive(Default)]
struct Slot {
    held: Mutex<bool>,
    released: Condvar,
}

impl InMemoryLockManager {
    pub fn new(num_locks: u32) -> Self {
        Self {
            slots: (0..num_locks).map(|_| Arc::new(Slot::default())).collect(),
            allocated: Mutex::new(vec![false; num_locks as usize]),
        }
    }

    fn limit(&self) -> u32 {
        self.slots.len() as u32
    }

    fn index(&self, id: LockId) -> PodliteResult<usize> {
        if id.0 >= self.limit() {
            return Err(out_of_range(id, self.limit()));
        }
        Ok(id.0 as usize)
    }
}

impl LockManager for InMemoryLockManager {
    fn allocate(&self) -> PodliteResult<LockId> {
        let mut allocated = self.allocated.lock();
        let free = allocated
            .iter()
            .position(|used| !used)
            .ok_or_else(|| exhausted(Some(self.limit())))?;
        allocated[free] = true;
        Ok(LockId(free as u32))
    }

    fn retrieve(&self, id: LockId) -> PodliteResult<Arc<dyn Locker>> {
        let index = self.index(id)?;
        if !self.allocated.lock()[index] {
            return Err(not_allocated(id));
        }
        Ok(Arc::new(MemoryLock {
            id,
            slot: self.slots[index].clone(),
        }))
    }

    fn reserve(&self, id: LockId) -> PodliteResult<()> {
        let index = self.index(id)?;
        let mut allocated = self.allocated.lock();
        if allocated[index] {
            return Err(taken(id));
        }
        allocated[index] = true;
        Ok(())
    }

    fn free(&self, id: LockId) -> PodliteResult<()> {
        let index = self.index(id)?;
        let mut allocated = self.allocated.lock();
        if !allocated[index] {
            return Err(not_allocated(id));
        }
        allocated[index] = false;
        Ok(())
    }

    fn clear_all_locks(&self) -> PodliteResult<()> {
        self.allocated.lock().fill(false);
        Ok(())
    }

    fn available(&self) -> Option<u32> {
        Some(self.allocated.lock().iter().filter(|used| !**used).count() as u32)
    }
}

struct MemoryLock {
    id: LockId,
    slot: Arc<Slot>,
}

impl Locker for MemoryLock {
    fn id(&self) -> LockId {
        self.id
    }

    fn lock(&self) {
        let mut held = self.slot.held.lock();
        while *held {
            self.slot.released.wait(&mut held);
        }
        *held = true;
    }

    fn unlock(&self) {
        *self.slot.held.lock() = false;
        self.slot.released.notify_one();
    }

    fn try_lock(&self) -> bool {
        let mut held = self.slot.held.lock();
        if *held {
            return false;
        }
        *held = true;
        true
    }
}
