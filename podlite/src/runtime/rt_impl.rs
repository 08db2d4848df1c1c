use std::path::Path;
use std::sync::Arc;

use podlite_shared::errors::{PodliteError, PodliteResult};

use crate::container::Container;
use crate::container::config::ContainerConfig;
use crate::container::state::ContainerState;
use crate::db::{ContainerStore, Database, DbConfig, PodStore, VolumeStore};
use crate::events::{Event, EventLog, EventStatus, EventType};
use crate::fs::chown::chown_path;
use crate::init_logging_for;
use crate::lock::{FileLockManager, LockId, LockManager};
use crate::pod::{PodConfig, PodState};
use crate::runtime::collaborators::Collaborators;
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::options::RuntimeOptions;
use crate::runtime::types::{ContainerID, PodID};
use crate::volume::Volume;
use crate::volume::config::{VolumeConfig, VolumeState};

/// Shared runtime state. Handles keep an `Arc` of it.
pub type SharedRuntimeImpl = Arc<RuntimeImpl>;

/// Runtime inner implementation.
///
/// **Locking Strategy**:
/// - Every field is immutable after construction or internally synchronized
/// - Entity state is serialized by per-entity locks from `lock_manager`,
///   which hold across processes; the store is the only shared state
/// - Lock order: pod, then container, then volume
pub struct RuntimeImpl {
    pub(crate) options: RuntimeOptions,
    /// Filesystem layout (immutable after init)
    pub(crate) layout: FilesystemLayout,
    pub(crate) db: Database,
    pub(crate) containers: ContainerStore,
    pub(crate) pods: PodStore,
    pub(crate) volumes: VolumeStore,
    /// Per-entity lock manager for multiprocess-safe locking.
    pub(crate) lock_manager: Arc<dyn LockManager>,
    pub(crate) collaborators: Collaborators,
    pub(crate) events: EventLog,
}

impl RuntimeImpl {
    // ========================================================================
    // CONSTRUCTION
    // ========================================================================

    /// Create the runtime: filesystem, logging, store, locks. Refreshes the
    /// store when the host rebooted since the last run and drops exit codes
    /// past their retention.
    pub fn new(
        options: RuntimeOptions,
        collaborators: Collaborators,
    ) -> PodliteResult<SharedRuntimeImpl> {
        if !options.home_dir.is_absolute() {
            return Err(PodliteError::Config(format!(
                "home_dir must be absolute path, got: {}",
                options.home_dir.display()
            )));
        }

        let layout = FilesystemLayout::new(&options);
        layout.prepare().map_err(|e| {
            PodliteError::Storage(format!(
                "Failed to initialize filesystem at {}: {}",
                layout.home_dir().display(),
                e
            ))
        })?;

        init_logging_for(&layout)?;

        let db = Database::open(&layout.db_path()).map_err(|e| {
            e.context(format!("opening database at {}", layout.db_path().display()))
        })?;
        db.validate_db_config(&DbConfig::from_options(&options))?;

        let lock_manager: Arc<dyn LockManager> = Arc::new(
            FileLockManager::new(layout.locks_dir(), Some(options.num_locks)).map_err(|e| {
                e.context(format!(
                    "initializing lock manager at {}",
                    layout.locks_dir().display()
                ))
            })?,
        );
        tracing::debug!(lock_dir = %layout.locks_dir().display(), "Initialized lock manager");

        let inner = Arc::new(Self {
            events: EventLog::new(layout.events_file()),
            containers: ContainerStore::new(db.clone()),
            pods: PodStore::new(db.clone()),
            volumes: VolumeStore::new(db.clone()),
            db,
            layout,
            options,
            lock_manager,
            collaborators,
        });

        if inner.db.check_and_update_boot()? {
            tracing::info!("host rebooted since last run, refreshing state");
            inner.refresh()?;
        }
        if let Err(e) = inner.containers.prune_exit_codes() {
            tracing::warn!(error = %e, "failed to prune stale exit codes");
        }

        tracing::debug!(home = %inner.layout.home_dir().display(), "initialized runtime");
        Ok(inner)
    }

    /// Forget host resources recorded before a reboot and rebuild lock
    /// allocations from the stored entities.
    pub fn refresh(&self) -> PodliteResult<()> {
        self.db.refresh()?;

        self.lock_manager.clear_all_locks()?;
        let mut lock_ids: Vec<(String, LockId)> = Vec::new();
        lock_ids.extend(
            self.containers
                .all()?
                .into_iter()
                .map(|(c, _)| (c.id.to_string(), c.lock_id)),
        );
        lock_ids.extend(
            self.pods
                .all()?
                .into_iter()
                .map(|(p, _)| (p.id.to_string(), p.lock_id)),
        );
        lock_ids.extend(
            self.volumes
                .all()?
                .into_iter()
                .map(|(v, _)| (v.name.clone(), v.lock_id)),
        );
        for (owner, lock_id) in lock_ids {
            if let Err(e) = self.lock_manager.reserve(lock_id) {
                tracing::warn!(owner = %owner, lock_id = %lock_id, error = %e, "failed to reclaim lock");
            }
        }

        clear_dir(self.layout.tmp_dir());

        self.events
            .write(Event::new(EventType::System, EventStatus::Refresh, "", ""));
        tracing::info!("refreshed runtime state");
        Ok(())
    }

    // ========================================================================
    // CONTAINERS
    // ========================================================================

    /// Store a new container and return its handle.
    pub fn create_container(
        self: &Arc<Self>,
        mut config: ContainerConfig,
    ) -> PodliteResult<Container> {
        if config.name.is_empty() {
            config.name = format!("podlite-{}", config.id.short());
        }
        if !config.cgroup_parent.is_empty() {
            config.cgroup_parent = self.options.cgroup_manager.validate_parent(
                &config.cgroup_parent,
                self.collaborators.capabilities.is_rootless(),
            )?;
        } else if let Some(pod) = &config.pod {
            // Members are placed under the pod's cgroup when it has one.
            let (_, pod_state) = self.pods.pod(pod)?;
            if let Some(path) = pod_state.cgroup_path {
                config.cgroup_parent = path;
            }
        }

        config.lock_id = self.lock_manager.allocate()?;
        config.static_dir = self.layout.container_static_dir(&config.id);
        let state = ContainerState::new(self.layout.container_run_dir(&config.id));

        if let Err(e) = self.store_new_container(&config, &state) {
            self.release_lock(&config.id.to_string(), config.lock_id);
            remove_dir_quietly(&config.static_dir);
            return Err(e.context(format!("creating container {}", config.name)));
        }

        self.events.write(Event::new(
            EventType::Container,
            EventStatus::Create,
            config.id.as_str(),
            &config.name,
        ));
        tracing::info!(container_id = %config.id, name = %config.name, "created container");
        Container::new(config, state, self.clone())
    }

    fn store_new_container(
        &self,
        config: &ContainerConfig,
        state: &ContainerState,
    ) -> PodliteResult<()> {
        std::fs::create_dir_all(&config.static_dir).map_err(|e| {
            PodliteError::Storage(format!(
                "creating {}: {}",
                config.static_dir.display(),
                e
            ))
        })?;
        match &config.pod {
            Some(pod) => self.containers.add_to_pod(pod, config, state),
            None => self.containers.add(config, state),
        }
    }

    /// Handle for a container by name or (partial) ID.
    pub fn container(self: &Arc<Self>, id_or_name: &str) -> PodliteResult<Container> {
        let (config, state) = self.containers.lookup(id_or_name)?;
        Container::new(config, state, self.clone())
    }

    pub(crate) fn container_by_id(self: &Arc<Self>, id: &ContainerID) -> PodliteResult<Container> {
        let (config, state) = self.containers.get(id)?;
        Container::new(config, state, self.clone())
    }

    pub fn containers(self: &Arc<Self>) -> PodliteResult<Vec<Container>> {
        self.containers
            .all()?
            .into_iter()
            .map(|(config, state)| Container::new(config, state, self.clone()))
            .collect()
    }

    // ========================================================================
    // PODS
    // ========================================================================

    pub fn create_pod(&self, mut config: PodConfig) -> PodliteResult<PodID> {
        let rootless = self.collaborators.capabilities.is_rootless();
        let mut state = PodState::default();
        if config.uses_cgroup {
            let manager = self.options.cgroup_manager;
            let parent = manager.validate_parent(&config.cgroup_parent, rootless)?;
            state.cgroup_path = Some(manager.pod_path(&parent, &config.id, rootless)?);
            config.cgroup_parent = parent;
        }

        config.lock_id = self.lock_manager.allocate()?;
        if let Err(e) = self.pods.add(&config, &state) {
            self.release_lock(&config.id.to_string(), config.lock_id);
            return Err(e.context(format!("creating pod {}", config.name)));
        }

        self.events.write(Event::new(
            EventType::Pod,
            EventStatus::Create,
            config.id.as_str(),
            &config.name,
        ));
        tracing::info!(pod_id = %config.id, name = %config.name, "created pod");
        Ok(config.id)
    }

    pub fn pod(&self, id_or_name: &str) -> PodliteResult<(PodConfig, PodState)> {
        self.pods.lookup(id_or_name)
    }

    // ========================================================================
    // VOLUMES
    // ========================================================================

    /// Store a new volume. Local volumes get a data directory; plugin
    /// volumes are created through their driver.
    pub fn create_volume(self: &Arc<Self>, mut config: VolumeConfig) -> PodliteResult<Volume> {
        config.validate()?;
        if self.volumes.has(&config.name)? {
            return Err(PodliteError::NameExists(format!("volume {}", config.name)));
        }

        let mut state = VolumeState::default();
        if config.uses_driver() {
            let driver = self.collaborators.volume_driver(&config.driver)?;
            match driver.create(&config.name, &config.options) {
                Ok(()) => {}
                Err(PodliteError::IdExists(_) | PodliteError::NameExists(_)) => {
                    tracing::debug!(volume = %config.name, "volume already exists in plugin");
                }
                Err(e) => return Err(e.context(format!("creating volume {}", config.name))),
            }
        } else {
            let data_dir = self.layout.volume_dir(&config.name).join("_data");
            std::fs::create_dir_all(&data_dir).map_err(|e| {
                PodliteError::Storage(format!("creating {}: {}", data_dir.display(), e))
            })?;
            if config.uid.is_some() || config.gid.is_some() {
                chown_path(&data_dir, config.uid.unwrap_or(0), config.gid.unwrap_or(0))?;
            } else {
                state.needs_chown = true;
            }
            config.mount_point = data_dir;
        }

        config.lock_id = self.lock_manager.allocate()?;
        if let Err(e) = self.volumes.add(&config, &state) {
            self.release_lock(&config.name, config.lock_id);
            if !config.uses_driver() {
                remove_dir_quietly(&self.layout.volume_dir(&config.name));
            }
            return Err(e.context(format!("creating volume {}", config.name)));
        }

        self.events.write(Event::new(
            EventType::Volume,
            EventStatus::Create,
            &config.name,
            &config.name,
        ));
        tracing::info!(volume = %config.name, driver = %config.driver, "created volume");
        Volume::new(config, state, self.clone())
    }

    pub fn volume(self: &Arc<Self>, name: &str) -> PodliteResult<Volume> {
        let (config, state) = self.volumes.volume(name)?;
        Volume::new(config, state, self.clone())
    }

    pub fn volumes(self: &Arc<Self>) -> PodliteResult<Vec<Volume>> {
        self.volumes
            .all()?
            .into_iter()
            .map(|(config, state)| Volume::new(config, state, self.clone()))
            .collect()
    }

    // ========================================================================
    // INTERNAL
    // ========================================================================

    pub(crate) fn release_lock(&self, owner: &str, lock_id: LockId) {
        if let Err(e) = self.lock_manager.free(lock_id) {
            tracing::warn!(owner = %owner, lock_id = %lock_id, error = %e, "Failed to free lock");
        } else {
            tracing::debug!(owner = %owner, lock_id = %lock_id, "Freed lock");
        }
    }
}

pub(crate) fn remove_dir_quietly(path: &Path) {
    if path.exists()
        && let Err(e) = std::fs::remove_dir_all(path)
    {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove directory");
    }
}

/// Empty `dir` without removing it.
fn clear_dir(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        if let Err(e) = result {
            tracing::debug!(path = %path.display(), error = %e, "failed to clear stale file");
        }
    }
}
