//! Named volumes.
//!
//! A [`Volume`] is a handle over a stored volume record, built the same way
//! as a container handle: the state it holds is a cache that every
//! operation reloads under the volume's lock and saves back before
//! releasing it.
//!
//! Mounting is reference counted. Only the transition from zero to one user
//! performs a real mount and only the transition back to zero unmounts, so
//! any number of containers can share one host mount.

pub mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::mount::{MntFlags, MsFlags};
use parking_lot::RwLock;
use podlite_shared::errors::{PodliteError, PodliteResult};

use crate::caps::Platform;
use crate::events::{Event, EventStatus, EventType};
use crate::fs::chown::chown_path;
use crate::lock::{LockGuard, Locker};
use crate::runtime::rt_impl::SharedRuntimeImpl;
use config::{VolumeConfig, VolumeState};

pub struct Volume {
    config: Arc<VolumeConfig>,
    state: RwLock<VolumeState>,
    lock: Arc<dyn Locker>,
    runtime: SharedRuntimeImpl,
}

impl Volume {
    pub(crate) fn new(
        config: VolumeConfig,
        state: VolumeState,
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

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Last state seen by this handle.
    pub fn state(&self) -> VolumeState {
        self.state.read().clone()
    }

    pub fn sync(&self) -> PodliteResult<VolumeState> {
        self.with_lock(|state| Ok(state.clone()))
    }

    pub(crate) fn with_lock<R>(
        &self,
        f: impl FnOnce(&mut VolumeState) -> PodliteResult<R>,
    ) -> PodliteResult<R> {
        let _guard = LockGuard::new(&*self.lock);
        let (_, mut state) = self
            .runtime
            .volumes
            .volume(self.name())
            .map_err(|e| e.context(format!("volume {}: loading state", self.name())))?;
        let result = f(&mut state);
        *self.state.write() = state;
        result
    }

    fn save_state(&self, state: &VolumeState) -> PodliteResult<()> {
        self.runtime
            .volumes
            .save(self.name(), state)
            .map_err(|e| e.context(format!("volume {}: saving state", self.name())))
    }

    /// Where the volume's data is on the host. A plugin volume only has a
    /// mount point while it is mounted.
    pub fn mount_point(&self) -> PodliteResult<Option<PathBuf>> {
        if !self.config.uses_driver() {
            return Ok(Some(self.config.mount_point.clone()));
        }
        let state = self.sync()?;
        Ok(state.mount_point.filter(|_| state.mount_count > 0))
    }

    /// Whether mount and unmount do any work for this volume.
    pub fn needs_mount(&self) -> bool {
        self.config.needs_mount()
    }

    /// Take a mount reference, mounting on the first one.
    pub fn mount(&self) -> PodliteResult<PathBuf> {
        self.with_lock(|state| {
            if !self.needs_mount() {
                return Ok(self.config.mount_point.clone());
            }

            if state.mount_count > 0 {
                state.mount_count += 1;
                tracing::debug!(volume = %self.name(), count = state.mount_count, "volume already mounted");
                self.save_state(state)?;
                return self.current_mount_point(state);
            }

            if self.config.uses_driver() {
                let driver = self.runtime.collaborators.volume_driver(&self.config.driver)?;
                let path = driver
                    .mount(self.name(), &self.mount_id())
                    .map_err(|e| e.context(format!("mounting volume {}", self.name())))?;
                state.mount_point = Some(path);
            } else {
                self.mount_local()?;
            }

            state.mount_count = 1;
            self.save_state(state)?;
            self.runtime.events.write(Event::new(
                EventType::Volume,
                EventStatus::Mount,
                self.name(),
                self.name(),
            ));
            tracing::info!(volume = %self.name(), "mounted volume");
            self.current_mount_point(state)
        })
    }

    /// Drop a mount reference, unmounting on the last one. `force` drops
    /// every reference at once.
    pub fn unmount(&self, force: bool) -> PodliteResult<()> {
        self.with_lock(|state| {
            if !self.needs_mount() {
                return Ok(());
            }
            if state.mount_count == 0 {
                return Err(PodliteError::VolumeNotMounted(self.name().to_string()));
            }
            if state.mount_count > 1 && !force {
                state.mount_count -= 1;
                tracing::debug!(volume = %self.name(), count = state.mount_count, "volume still in use");
                return self.save_state(state);
            }

            if self.config.uses_driver() {
                let driver = self.runtime.collaborators.volume_driver(&self.config.driver)?;
                driver
                    .unmount(self.name(), &self.mount_id())
                    .map_err(|e| e.context(format!("unmounting volume {}", self.name())))?;
                state.mount_point = None;
            } else {
                self.unmount_local()?;
            }

            state.mount_count = 0;
            self.save_state(state)?;
            self.runtime.events.write(Event::new(
                EventType::Volume,
                EventStatus::Unmount,
                self.name(),
                self.name(),
            ));
            tracing::info!(volume = %self.name(), "unmounted volume");
            Ok(())
        })
    }

    /// On first use, hand the volume's root to the container's process
    /// identity. Plugin volumes are left alone.
    pub(crate) fn fix_ownership(&self, uid: u32, gid: u32) -> PodliteResult<()> {
        if self.config.uses_driver() {
            return Ok(());
        }
        self.with_lock(|state| {
            if !state.needs_chown {
                return Ok(());
            }
            chown_path(&self.config.mount_point, uid, gid)
                .map_err(|e| e.context(format!("volume {}: fixing ownership", self.name())))?;
            state.needs_chown = false;
            state.uid_chowned = Some(uid);
            state.gid_chowned = Some(gid);
            self.save_state(state)
        })
    }

    fn current_mount_point(&self, state: &VolumeState) -> PodliteResult<PathBuf> {
        if self.config.uses_driver() {
            return state
                .mount_point
                .clone()
                .ok_or_else(|| PodliteError::VolumeNotMounted(self.name().to_string()));
        }
        Ok(self.config.mount_point.clone())
    }

    fn mount_id(&self) -> String {
        format!("podlite-{}", self.config.lock_id)
    }

    fn mount_local(&self) -> PodliteResult<()> {
        Platform::current().require_linux("mounting a volume")?;
        let options = &self.config.options;
        let fs_type = options.get("type").map(String::as_str);
        let device = options.get("device").map(String::as_str);
        let data = options.get("o").map(String::as_str);
        let target = &self.config.mount_point;

        let mut flags = MsFlags::empty();
        // A bind device names a host directory, not a block device.
        if fs_type.is_some_and(|t| t == "bind" || t == "none") {
            flags |= MsFlags::MS_BIND;
        }
        mount_syscall(device.or(fs_type), target, fs_type, flags, data).map_err(|e| {
            PodliteError::Storage(format!(
                "mounting volume {} at {}: {}",
                self.name(),
                target.display(),
                e
            ))
        })
    }

    fn unmount_local(&self) -> PodliteResult<()> {
        Platform::current().require_linux("unmounting a volume")?;
        let target = &self.config.mount_point;
        match nix::mount::umount2(target, MntFlags::MNT_DETACH) {
            Ok(()) => Ok(()),
            // Already gone, e.g. after a reboot.
            Err(nix::errno::Errno::EINVAL) => {
                tracing::debug!(volume = %self.name(), "volume was not mounted");
                Ok(())
            }
            Err(e) => Err(PodliteError::Storage(format!(
                "unmounting volume {} at {}: {}",
                self.name(),
                target.display(),
                e
            ))),
        }
    }
}

fn mount_syscall(
    source: Option<&str>,
    target: &Path,
    fs_type: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> nix::Result<()> {
    nix::mount::mount(source, target, fs_type, flags, data)
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.config.name)
            .field("driver", &self.config.driver)
            .finish()
    }
}
