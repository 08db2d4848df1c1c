//! Preparing a container: network namespace and storage.
//!
//! The two halves are unrelated and both block on the host, so they run on
//! scoped threads side by side. Their results are committed together with a
//! single state save. When either half fails, whatever the other half did is
//! undone before the joined error is returned.

use std::path::{Path, PathBuf};

use podlite_shared::errors::{PodliteError, PodliteResult};

use super::Container;
use super::state::ContainerState;
use crate::events::{Event, EventStatus, EventType};
use crate::fs::secure_join;
use crate::runtime::collaborators::NetworkSetup;
use crate::spec::user;

impl Container {
    // ========================================================================
    // PREPARE
    // ========================================================================

    /// Create the network namespace and mount storage.
    pub fn prepare(&self) -> PodliteResult<()> {
        self.with_lock(|state| self.prepare_locked(state))
            .map_err(|e| e.context(format!("container {}: prepare", self.id())))
    }

    pub(crate) fn prepare_locked(&self, state: &mut ContainerState) -> PodliteResult<()> {
        let config = self.config();
        let network = &self.runtime.collaborators.network;
        let create_netns = config.creates_network_namespace() && state.net_ns.is_none();
        let existing_mount = state
            .mountpoint
            .clone()
            .filter(|_| state.mounted);

        let (net_result, mount_result) = std::thread::scope(|s| {
            let net = s.spawn(|| -> PodliteResult<Option<NetworkSetup>> {
                if !create_netns {
                    return Ok(None);
                }
                network.setup(config).map(Some)
            });
            let mount = s.spawn(|| self.mount_storage(existing_mount.as_deref()));
            (join_branch(net, "network setup"), join_branch(mount, "storage mount"))
        });

        let mut errors = Vec::new();
        if let Some(setup) = net_result.unwrap_or_else(|e| {
            errors.push(e);
            None
        }) {
            state.net_ns = setup.netns;
            state.network_status = setup.status;
        }
        // Only roll back a mount this call made.
        let mut mounted_here = false;
        match mount_result {
            Ok((mountpoint, fresh)) => {
                state.mountpoint = Some(mountpoint);
                state.mounted = true;
                mounted_here = fresh;
            }
            Err(e) => errors.push(e),
        }

        if errors.is_empty() {
            match self.save_state(state) {
                Ok(()) => {
                    self.runtime.events.write(Event::new(
                        EventType::Container,
                        EventStatus::Prepare,
                        self.id().as_str(),
                        self.name(),
                    ));
                    tracing::info!(container_id = %self.id(), "prepared container");
                    return Ok(());
                }
                Err(e) => errors.push(e.context("saving prepared state")),
            }
        }

        self.rollback_prepare(state, mounted_here, &mut errors);
        Err(PodliteError::join(errors)
            .unwrap_or_else(|| PodliteError::Internal("prepare failed without an error".into())))
    }

    /// Undo a failed prepare. The network namespace recorded in `state` is
    /// torn down whoever created it; storage only when `unmount` is set.
    fn rollback_prepare(
        &self,
        state: &mut ContainerState,
        unmount: bool,
        errors: &mut Vec<PodliteError>,
    ) {
        if unmount {
            match self.unmount_storage(true) {
                Ok(()) => {
                    state.mounted = false;
                    state.mountpoint = None;
                }
                Err(e) => {
                    tracing::warn!(container_id = %self.id(), error = %e, "failed to unmount storage during rollback");
                    errors.push(e.context("unmounting storage"));
                }
            }
        }

        let netns = state.net_ns.take();
        match self
            .runtime
            .collaborators
            .network
            .teardown(self.config(), netns.as_deref())
        {
            Ok(()) => state.network_status.clear(),
            Err(e) => {
                tracing::warn!(container_id = %self.id(), error = %e, "failed to tear down network during rollback");
                errors.push(e.context("tearing down network"));
                state.net_ns = netns;
            }
        }

        if let Err(e) = self.save_state(state) {
            errors.push(e.context("saving state after rollback"));
        }
    }

    /// Mount the rootfs and every named volume. A failure unmounts what
    /// this call mounted. The flag is false when an existing mount was reused.
    fn mount_storage(&self, existing: Option<&Path>) -> PodliteResult<(PathBuf, bool)> {
        let config = self.config();
        let storage = &self.runtime.collaborators.storage;

        let mountpoint = match existing {
            Some(mp) if mp.exists() => {
                tracing::debug!(container_id = %self.id(), mountpoint = %mp.display(), "storage already mounted");
                return Ok((mp.to_path_buf(), false));
            }
            _ => storage
                .mount(config)
                .map_err(|e| e.context("mounting storage"))?,
        };

        let mut mounted: Vec<crate::volume::Volume> = Vec::new();
        let result = config.named_volumes.iter().try_for_each(|nv| {
            let volume = self.runtime.volume(&nv.name)?;
            volume.mount()?;
            mounted.push(volume);
            Ok(())
        });
        if let Err(e) = result {
            for volume in mounted.iter().rev() {
                if let Err(err) = volume.unmount(false) {
                    tracing::warn!(volume = %volume.name(), error = %err, "failed to release volume mount");
                }
            }
            if let Err(err) = storage.unmount(config, true) {
                tracing::warn!(container_id = %self.id(), error = %err, "failed to unmount storage");
            }
            return Err(e);
        }

        self.fix_volume_ownership(&mountpoint, &mounted);
        Ok((mountpoint, true))
    }

    /// Give fresh local volumes to the container's process identity.
    fn fix_volume_ownership(&self, mountpoint: &Path, volumes: &[crate::volume::Volume]) {
        if volumes.is_empty() {
            return;
        }
        let ids = secure_join(mountpoint, "/etc/passwd")
            .and_then(|passwd| Ok((passwd, secure_join(mountpoint, "/etc/group")?)))
            .and_then(|(passwd, group)| user::exec_user(&passwd, &group, &self.config().user))
            .and_then(|exec| self.host_ids(exec.uid, exec.gid));
        let (uid, gid) = match ids {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(container_id = %self.id(), error = %e, "cannot resolve user, leaving volume ownership");
                return;
            }
        };
        for volume in volumes {
            if let Err(e) = volume.fix_ownership(uid, gid) {
                tracing::warn!(volume = %volume.name(), error = %e, "failed to fix volume ownership");
            }
        }
    }

    /// Release named volumes and the rootfs. Every step runs; the errors
    /// are joined.
    fn unmount_storage(&self, force: bool) -> PodliteResult<()> {
        let config = self.config();
        let mut errors = Vec::new();
        for nv in config.named_volumes.iter().rev() {
            let result = self.runtime.volume(&nv.name).and_then(|v| v.unmount(false));
            match result {
                Ok(()) => {}
                Err(e) if e.is_not_found() || matches!(e, PodliteError::VolumeNotMounted(_)) => {
                    tracing::debug!(volume = %nv.name, error = %e, "volume already released");
                }
                Err(e) => errors.push(e),
            }
        }
        if let Err(e) = self.runtime.collaborators.storage.unmount(config, force) {
            errors.push(e);
        }
        PodliteError::join(errors).map_or(Ok(()), Err)
    }

    // ========================================================================
    // CLEANUP
    // ========================================================================

    /// Tear down the network namespace, if there is one.
    pub fn cleanup_network(&self) -> PodliteResult<()> {
        self.with_lock(|state| self.cleanup_network_locked(state))
    }

    pub(crate) fn cleanup_network_locked(&self, state: &mut ContainerState) -> PodliteResult<()> {
        let Some(netns) = state.net_ns.clone() else {
            tracing::debug!(container_id = %self.id(), "no network namespace to clean up");
            return Ok(());
        };
        self.runtime
            .collaborators
            .network
            .teardown(self.config(), Some(&netns))
            .map_err(|e| e.context(format!("container {}: tearing down network", self.id())))?;
        state.net_ns = None;
        state.network_status.clear();
        self.save_state(state)
    }

    /// Unmount storage and named volumes if mounted.
    pub fn cleanup_storage(&self) -> PodliteResult<()> {
        self.with_lock(|state| self.cleanup_storage_locked(state, false))
    }

    pub(crate) fn cleanup_storage_locked(
        &self,
        state: &mut ContainerState,
        force: bool,
    ) -> PodliteResult<()> {
        if !state.mounted {
            tracing::debug!(container_id = %self.id(), "storage not mounted");
            return Ok(());
        }
        self.unmount_storage(force)
            .map_err(|e| e.context(format!("container {}: cleaning up storage", self.id())))?;
        state.mounted = false;
        state.mountpoint = None;
        self.save_state(state)?;
        self.runtime.events.write(Event::new(
            EventType::Container,
            EventStatus::Cleanup,
            self.id().as_str(),
            self.name(),
        ));
        Ok(())
    }
}

fn join_branch<T>(
    handle: std::thread::ScopedJoinHandle<'_, PodliteResult<T>>,
    what: &str,
) -> PodliteResult<T> {
    handle
        .join()
        .unwrap_or_else(|_| Err(PodliteError::Internal(format!("{} panicked", what))))
}
