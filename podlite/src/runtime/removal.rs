//! Removing containers, volumes and pods.
//!
//! Removal is idempotent: an entity that is already gone counts as removed.
//! Cleanup steps keep going past a failed step and report the joined
//! errors at the end.

use std::sync::Arc;
use std::time::Duration;

use podlite_shared::errors::{PodliteError, PodliteResult};

use super::graph::DependencyGraph;
use super::rt_impl::{RuntimeImpl, remove_dir_quietly};
use crate::caps::CGROUP_ROOT;
use crate::container::Container;
use crate::container::state::ContainerStatus;
use crate::events::{Event, EventStatus, EventType};
use crate::lock::LockGuard;
use crate::spec::cgroup::remove_cgroup_dir;

/// Turn a not-found result into success.
fn ignore_not_found<T>(result: PodliteResult<T>) -> PodliteResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

impl RuntimeImpl {
    // ========================================================================
    // CONTAINERS
    // ========================================================================

    /// Remove a container. With `force`, containers depending on it are
    /// removed first and a running container is stopped.
    pub fn remove_container(
        self: &Arc<Self>,
        id_or_name: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> PodliteResult<()> {
        let Some(ctr) = ignore_not_found(self.container(id_or_name))? else {
            tracing::debug!(container = %id_or_name, "container already removed");
            return Ok(());
        };
        self.remove_container_handle(&ctr, force, timeout)
    }

    fn remove_container_handle(
        self: &Arc<Self>,
        ctr: &Container,
        force: bool,
        timeout: Option<Duration>,
    ) -> PodliteResult<()> {
        let id = ctr.id().clone();

        // Dependents go first, and never while this container is locked.
        let Some(dependents) = ignore_not_found(self.containers.in_use(&id))? else {
            return Ok(());
        };
        if !dependents.is_empty() {
            if !force {
                let names: Vec<String> = dependents.iter().map(|d| d.to_string()).collect();
                return Err(PodliteError::Busy(format!(
                    "container {} has dependent containers which must be removed before it: {}",
                    id,
                    names.join(", ")
                )));
            }
            for dep in dependents {
                if let Some(dep_ctr) = ignore_not_found(self.container_by_id(&dep))? {
                    self.remove_container_handle(&dep_ctr, force, timeout)?;
                }
            }
        }

        let config = ctr.config();
        let outcome = ignore_not_found(ctr.with_lock(|state| {
            if state.status.is_active() {
                if !force {
                    return Err(PodliteError::InvalidState(format!(
                        "cannot remove container {} as it is {}, use force to stop it first",
                        id, state.status
                    )));
                }
                tracing::info!(container_id = %id, "stopping container before removal");
                self.collaborators
                    .oci
                    .stop(config, state.pid, timeout)
                    .map_err(|e| e.context(format!("container {}: stopping", id)))?;
                state.pid = None;
                state.status = ContainerStatus::Stopped;
            }
            state.status = ContainerStatus::Removing;
            ctr.save_state(state)?;

            let mut errors = Vec::new();
            if let Err(e) = ctr.cleanup_network_locked(state) {
                tracing::warn!(container_id = %id, error = %e, "failed to clean up network");
                errors.push(e);
            }
            if let Err(e) = ctr.cleanup_storage_locked(state, true) {
                tracing::warn!(container_id = %id, error = %e, "failed to clean up storage");
                errors.push(e);
            }
            if let Err(e) = self.containers.remove_container_exec_sessions(&id) {
                errors.push(e);
            }

            let removed = match &config.pod {
                Some(pod) => self.containers.remove_from_pod(pod, config),
                None => self.containers.remove(config),
            };
            ignore_not_found(removed)
                .map_err(|e| e.context(format!("container {}: removing from state", id)))?;
            Ok(errors)
        }))?;

        let Some(errors) = outcome else {
            tracing::debug!(container_id = %id, "container removed concurrently");
            return Ok(());
        };

        self.release_lock(id.as_str(), config.lock_id);
        remove_dir_quietly(&config.static_dir);
        remove_dir_quietly(&ctr.state().run_dir);

        self.events.write(Event::new(
            EventType::Container,
            EventStatus::Remove,
            id.as_str(),
            ctr.name(),
        ));
        tracing::info!(container_id = %id, "Removed container");

        match PodliteError::join(errors) {
            Some(e) => Err(e.context(format!("container {}: cleanup during removal", id))),
            None => Ok(()),
        }
    }

    // ========================================================================
    // VOLUMES
    // ========================================================================

    /// Remove a volume. With `force`, containers using it are removed first.
    pub fn remove_volume(
        self: &Arc<Self>,
        name: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> PodliteResult<()> {
        let Some(volume) = ignore_not_found(self.volume(name))? else {
            tracing::debug!(volume = %name, "volume already removed");
            return Ok(());
        };

        let users = ignore_not_found(self.volumes.in_use(name))?.unwrap_or_default();
        if !users.is_empty() {
            if !force {
                let names: Vec<String> = users.iter().map(|u| u.to_string()).collect();
                return Err(PodliteError::Busy(format!(
                    "volume {} is being used by the following container(s): {}",
                    name,
                    names.join(", ")
                )));
            }
            for user in users {
                if let Some(ctr) = ignore_not_found(self.container_by_id(&user))? {
                    self.remove_container_handle(&ctr, true, timeout)?;
                }
            }
        }

        let state = match ignore_not_found(volume.sync())? {
            Some(state) => state,
            None => return Ok(()),
        };
        if volume.needs_mount()
            && state.mount_count > 0
            && let Err(e) = volume.unmount(true)
        {
            tracing::warn!(volume = %name, error = %e, "failed to unmount volume before removal");
        }

        let config = volume.config();
        let removed = ignore_not_found(volume.with_lock(|_| {
            if config.uses_driver() {
                let driver = self.collaborators.volume_driver(&config.driver)?;
                if let Err(e) = driver.remove(name) {
                    if !e.is_not_found() {
                        return Err(e.context(format!("volume {}: removing from plugin", name)));
                    }
                    tracing::debug!(volume = %name, "plugin no longer knows the volume");
                }
            }
            ignore_not_found(self.volumes.remove(name)).map(|_| ())
        }))?;
        if removed.is_none() {
            return Ok(());
        }

        self.release_lock(name, config.lock_id);
        if !config.uses_driver() {
            remove_dir_quietly(&self.layout.volume_dir(name));
        }
        self.events.write(Event::new(
            EventType::Volume,
            EventStatus::Remove,
            name,
            name,
        ));
        tracing::info!(volume = %name, "Removed volume");
        Ok(())
    }

    // ========================================================================
    // PODS
    // ========================================================================

    /// Remove a pod. With `force`, its members are removed first, dependents
    /// before their dependencies.
    pub fn remove_pod(
        self: &Arc<Self>,
        id_or_name: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> PodliteResult<()> {
        let Some((config, state)) = ignore_not_found(self.pods.lookup(id_or_name))? else {
            tracing::debug!(pod = %id_or_name, "pod already removed");
            return Ok(());
        };
        let id = config.id.clone();
        let lock = self.lock_manager.retrieve(config.lock_id)?;

        let mut errors = Vec::new();
        {
            let _guard = LockGuard::new(&*lock);

            let members = ignore_not_found(self.pods.containers(&id))?.unwrap_or_default();
            if !members.is_empty() && !force {
                return Err(PodliteError::Busy(format!(
                    "pod {} contains {} containers, use force to remove them",
                    id,
                    members.len()
                )));
            }

            let graph = DependencyGraph::build(members.iter().map(|(c, _)| c));
            for ctr_id in graph.removal_order()? {
                let result = self
                    .container_by_id(&ctr_id)
                    .and_then(|ctr| self.remove_container_handle(&ctr, true, timeout));
                if let Err(e) = ignore_not_found(result) {
                    tracing::warn!(pod_id = %id, container_id = %ctr_id, error = %e, "failed to remove pod member");
                    errors.push(e);
                }
            }
            if !errors.is_empty() {
                return Err(PodliteError::join(errors)
                    .unwrap_or_else(|| PodliteError::Internal("pod member removal failed".into()))
                    .context(format!("pod {}: removing containers", id)));
            }

            if let Some(path) = &state.cgroup_path {
                let removed = self
                    .options
                    .cgroup_manager
                    .host_dir(std::path::Path::new(CGROUP_ROOT), path)
                    .and_then(|dir| remove_cgroup_dir(&dir));
                if let Err(e) = removed {
                    tracing::warn!(pod_id = %id, error = %e, "failed to remove pod cgroup");
                    errors.push(e);
                }
            }

            if let Err(e) = ignore_not_found(self.pods.remove(&id)) {
                errors.push(e.context(format!("pod {}: removing from state", id)));
                return Err(PodliteError::join(errors)
                    .unwrap_or_else(|| PodliteError::Internal("pod removal failed".into())));
            }
        }

        self.release_lock(id.as_str(), config.lock_id);
        self.events.write(Event::new(
            EventType::Pod,
            EventStatus::Remove,
            id.as_str(),
            &config.name,
        ));
        tracing::info!(pod_id = %id, "Removed pod");

        PodliteError::join(errors).map_or(Ok(()), Err)
    }
}
