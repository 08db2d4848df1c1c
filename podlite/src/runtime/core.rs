//! Public runtime entry point.

use std::time::Duration;

use crate::container::Container;
use crate::container::config::ContainerConfig;
use crate::events::EventLog;
use crate::pod::{PodConfig, PodState};
use crate::runtime::collaborators::Collaborators;
use crate::runtime::options::RuntimeOptions;
use crate::runtime::rt_impl::{RuntimeImpl, SharedRuntimeImpl};
use crate::runtime::types::PodID;
use crate::volume::Volume;
use crate::volume::config::VolumeConfig;
use podlite_shared::errors::PodliteResult;

// ============================================================================
// PUBLIC API
// ============================================================================

/// Runtime provides the main entry point for creating and managing
/// containers, pods and volumes.
///
/// Any number of runtimes, in this process or others, may share one home
/// directory; the store and the entity locks keep them consistent.
///
/// **Cloning**: Runtime is cheaply cloneable via `Arc` - all clones share the same state.
#[derive(Clone)]
pub struct Runtime {
    rt_impl: SharedRuntimeImpl,
}

impl Runtime {
    /// Create a runtime with the provided options and collaborators.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `home_dir` is not absolute
    /// - Filesystem or database initialization fails
    /// - The database was initialized with different paths
    pub fn new(options: RuntimeOptions, collaborators: Collaborators) -> PodliteResult<Self> {
        Ok(Self {
            rt_impl: RuntimeImpl::new(options, collaborators)?,
        })
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.rt_impl.options
    }

    pub fn events(&self) -> &EventLog {
        &self.rt_impl.events
    }

    /// Reset state left over from before a reboot. Runs automatically at
    /// construction when a reboot is detected.
    pub fn refresh(&self) -> PodliteResult<()> {
        self.rt_impl.refresh()
    }

    // ========================================================================
    // CONTAINERS
    // ========================================================================

    /// Store a container configuration and return its handle.
    pub fn create_container(&self, config: ContainerConfig) -> PodliteResult<Container> {
        self.rt_impl.create_container(config)
    }

    /// Get a handle to a container by name or (partial) ID.
    pub fn container(&self, id_or_name: &str) -> PodliteResult<Container> {
        self.rt_impl.container(id_or_name)
    }

    pub fn containers(&self) -> PodliteResult<Vec<Container>> {
        self.rt_impl.containers()
    }

    /// Remove a container. Removing a missing container succeeds.
    pub fn remove_container(
        &self,
        id_or_name: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> PodliteResult<()> {
        self.rt_impl.remove_container(id_or_name, force, timeout)
    }

    // ========================================================================
    // PODS
    // ========================================================================

    pub fn create_pod(&self, config: PodConfig) -> PodliteResult<PodID> {
        self.rt_impl.create_pod(config)
    }

    pub fn pod(&self, id_or_name: &str) -> PodliteResult<(PodConfig, PodState)> {
        self.rt_impl.pod(id_or_name)
    }

    pub fn remove_pod(
        &self,
        id_or_name: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> PodliteResult<()> {
        self.rt_impl.remove_pod(id_or_name, force, timeout)
    }

    // ========================================================================
    // VOLUMES
    // ========================================================================

    pub fn create_volume(&self, config: VolumeConfig) -> PodliteResult<Volume> {
        self.rt_impl.create_volume(config)
    }

    pub fn volume(&self, name: &str) -> PodliteResult<Volume> {
        self.rt_impl.volume(name)
    }

    pub fn volumes(&self) -> PodliteResult<Vec<Volume>> {
        self.rt_impl.volumes()
    }

    /// Remove a volume. Removing a missing volume succeeds.
    pub fn remove_volume(
        &self,
        name: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> PodliteResult<()> {
        self.rt_impl.remove_volume(name, force, timeout)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("home_dir", &self.rt_impl.layout.home_dir())
            .finish()
    }
}

// ============================================================================
// THREAD SAFETY ASSERTIONS
// ============================================================================

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<Runtime>;
};
