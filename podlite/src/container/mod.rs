//! Container handle - holds config, a cached copy of state, and the entity lock.

// ============================================================================
// IMPORTS
// ============================================================================

pub mod bindmounts;
pub mod config;
pub mod copy;
pub mod nsexec;
pub mod prepare;
pub mod resolve;
pub mod state;

use std::path::PathBuf;
use std::sync::Arc;

use oci_spec::runtime::Spec;
use parking_lot::RwLock;
use podlite_shared::errors::{PodliteError, PodliteResult};

use crate::lock::{LockGuard, Locker};
use crate::runtime::rt_impl::SharedRuntimeImpl;
use crate::runtime::types::ContainerID;
use config::ContainerConfig;
use state::{ContainerState, ContainerStatus};

pub use copy::FileInfo;

// ============================================================================
// CONTAINER
// ============================================================================

/// A container known to the runtime.
///
/// The state held here is a cache. Every operation that depends on it takes
/// the container's lock and reloads it from the store first; every change
/// is saved back before the lock is released.
pub struct Container {
    config: Arc<ContainerConfig>,
    state: RwLock<ContainerState>,
    lock: Arc<dyn Locker>,
    pub(crate) runtime: SharedRuntimeImpl,
}

impl Container {
    // ========================================================================
    // CONSTRUCTION
    // ========================================================================

    pub(crate) fn new(
        config: ContainerConfig,
        state: ContainerState,
        runtime: SharedRuntimeImpl,
    ) -> PodliteResult<Self> {
        let lock = runtime.lock_manager.retrieve(config.lock_id)?;
        Ok(Self {
            config: Arc::new(config),
            state: RwLock::new(state),
            lock,
            runtime,
        })
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn id(&self) -> &ContainerID {
        &self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Last state seen by this handle. Call [`sync`](Self::sync) for a fresh copy.
    pub fn state(&self) -> ContainerState {
        self.state.read().clone()
    }

    pub fn status(&self) -> ContainerStatus {
        self.state.read().status
    }

    // ========================================================================
    // STATE SYNCHRONIZATION
    // ========================================================================

    /// Reload state from the store.
    pub fn sync(&self) -> PodliteResult<ContainerState> {
        self.with_lock(|state| Ok(state.clone()))
    }

    /// Apply a state change made by a lifecycle driver, such as recording the
    /// PID reported by the OCI runtime, and save it.
    pub fn modify_state(&self, f: impl FnOnce(&mut ContainerState)) -> PodliteResult<()> {
        self.with_lock(|state| {
            f(state);
            self.save_state(state)
        })
    }

    /// Run `f` under the container lock on freshly loaded state.
    ///
    /// Whatever `f` leaves in the state becomes the cached copy, saved or not;
    /// saving is up to `f`.
    pub(crate) fn with_lock<R>(
        &self,
        f: impl FnOnce(&mut ContainerState) -> PodliteResult<R>,
    ) -> PodliteResult<R> {
        let _guard = LockGuard::new(&*self.lock);
        let mut state = self
            .runtime
            .containers
            .state(self.id())
            .map_err(|e| e.context(format!("container {}: loading state", self.id())))?;
        let result = f(&mut state);
        *self.state.write() = state;
        result
    }

    pub(crate) fn save_state(&self, state: &ContainerState) -> PodliteResult<()> {
        self.runtime
            .containers
            .save(self.id(), state)
            .map_err(|e| e.context(format!("container {}: saving state", self.id())))
    }

    // ========================================================================
    // SPEC GENERATION
    // ========================================================================

    /// Produce the runtime spec for the next start.
    ///
    /// The container must have been prepared. Generated files are recorded
    /// in the bind-mount map and the state is saved before returning.
    pub fn generate_spec(&self) -> PodliteResult<Spec> {
        self.with_lock(|state| {
            if !state.mounted {
                return Err(PodliteError::InvalidState(format!(
                    "container {} must be prepared before generating its spec",
                    self.id()
                )));
            }
            bindmounts::make_bind_mounts(self, state)
                .map_err(|e| e.context(format!("container {}: creating bind mounts", self.id())))?;
            self.save_state(state)?;

            let spec = crate::spec::generate(self, state)
                .map_err(|e| e.context(format!("container {}: generating spec", self.id())))?;
            self.save_state(state)?;
            Ok(spec)
        })
    }

    // ========================================================================
    // PATHS
    // ========================================================================

    /// Where the named volume `name` is mounted on the host.
    pub(crate) fn volume_mount_point(&self, name: &str) -> PodliteResult<Option<PathBuf>> {
        self.runtime.volume(name)?.mount_point()
    }

    /// Map a container path to `(root, host_path)` using the mounted rootfs.
    pub fn resolve_path(&self, container_path: &str) -> PodliteResult<(PathBuf, PathBuf)> {
        let state = self.sync()?;
        let mountpoint = mountpoint_of(self.id(), &state)?;
        resolve::resolve_path(&self.config, &mountpoint, container_path, &|name| {
            self.volume_mount_point(name)
        })
    }

    /// Host UID/GID for a container UID/GID.
    pub(crate) fn host_ids(&self, uid: u32, gid: u32) -> PodliteResult<(u32, u32)> {
        self.config.id_mappings.host_ids(uid, gid)
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.config.id)
            .field("name", &self.config.name)
            .finish()
    }
}

/// Mountpoint of a mounted container.
pub(crate) fn mountpoint_of(id: &ContainerID, state: &ContainerState) -> PodliteResult<PathBuf> {
    match (&state.mountpoint, state.mounted) {
        (Some(mp), true) => Ok(mp.clone()),
        _ => Err(PodliteError::InvalidState(format!(
            "container {} is not mounted",
            id
        ))),
    }
}
