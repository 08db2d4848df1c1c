//! Shared fixtures for runtime integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use podlite::caps::StaticCapabilities;
use podlite::runtime::collaborators::{
    NetworkBackend, NetworkSetup, OciRuntime, StorageBackend, VolumeDriver,
};
use podlite::spec::cgroup::CgroupManager;
use podlite::{ContainerConfig, ContainerID, PodliteError, PodliteResult, Runtime, RuntimeOptions};
use tempfile::TempDir;

// ============================================================================
// STORAGE
// ============================================================================

/// Storage that hands out a plain directory per container.
#[derive(Debug)]
pub struct FakeStorage {
    root: PathBuf,
    pub mounts: AtomicUsize,
    pub unmounts: AtomicUsize,
    pub fail_mount: AtomicBool,
    /// When set to a store path, mounting deletes the container's state
    /// row behind the runtime's back so the next save fails.
    pub drop_state_in: Mutex<Option<PathBuf>>,
}

impl FakeStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mounts: AtomicUsize::new(0),
            unmounts: AtomicUsize::new(0),
            fail_mount: AtomicBool::new(false),
            drop_state_in: Mutex::new(None),
        }
    }

    pub fn rootfs(&self, id: &ContainerID) -> PathBuf {
        self.root.join(id.as_str()).join("merged")
    }
}

impl StorageBackend for FakeStorage {
    fn mount(&self, config: &ContainerConfig) -> PodliteResult<PathBuf> {
        if self.fail_mount.load(Ordering::SeqCst) {
            return Err(PodliteError::Storage("layer store unavailable".into()));
        }
        let rootfs = self.rootfs(&config.id);
        std::fs::create_dir_all(rootfs.join("etc"))?;
        std::fs::write(rootfs.join("etc/os-release"), "ID=fake\n")?;
        if let Some(db) = self.drop_state_in.lock().as_ref() {
            let conn = rusqlite::Connection::open(db).unwrap();
            conn.execute("DELETE FROM ContainerState WHERE Id = ?1", [config.id.as_str()])
                .unwrap();
        }
        self.mounts.fetch_add(1, Ordering::SeqCst);
        Ok(rootfs)
    }

    fn unmount(&self, _config: &ContainerConfig, _force: bool) -> PodliteResult<()> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// NETWORK
// ============================================================================

#[derive(Debug, Default)]
pub struct FakeNetwork {
    pub setups: AtomicUsize,
    pub teardowns: Mutex<Vec<Option<PathBuf>>>,
    pub fail_setup: AtomicBool,
}

impl NetworkBackend for FakeNetwork {
    fn setup(&self, config: &ContainerConfig) -> PodliteResult<NetworkSetup> {
        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(PodliteError::Network("bridge is down".into()));
        }
        self.setups.fetch_add(1, Ordering::SeqCst);
        Ok(NetworkSetup {
            netns: Some(PathBuf::from(format!("/run/netns/podlite-{}", config.id.short()))),
            status: BTreeMap::new(),
        })
    }

    fn teardown(&self, _config: &ContainerConfig, netns: Option<&Path>) -> PodliteResult<()> {
        self.teardowns.lock().push(netns.map(Path::to_path_buf));
        Ok(())
    }
}

// ============================================================================
// OCI RUNTIME
// ============================================================================

#[derive(Debug, Default)]
pub struct FakeOci {
    pub stopped: Mutex<Vec<ContainerID>>,
}

impl OciRuntime for FakeOci {
    fn stop(
        &self,
        config: &ContainerConfig,
        _pid: Option<i32>,
        _timeout: Option<Duration>,
    ) -> PodliteResult<()> {
        self.stopped.lock().push(config.id.clone());
        Ok(())
    }
}

// ============================================================================
// VOLUME PLUGIN
// ============================================================================

/// Plugin keeping its volumes as directories under one root.
#[derive(Debug)]
pub struct FakeDriver {
    root: PathBuf,
    pub mounts: AtomicUsize,
    pub unmounts: AtomicUsize,
    pub removed: Mutex<Vec<String>>,
}

pub const FAKE_DRIVER: &str = "fake";

impl FakeDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mounts: AtomicUsize::new(0),
            unmounts: AtomicUsize::new(0),
            removed: Mutex::new(Vec::new()),
        }
    }
}

impl VolumeDriver for FakeDriver {
    fn name(&self) -> &str {
        FAKE_DRIVER
    }

    fn create(&self, name: &str, _options: &BTreeMap<String, String>) -> PodliteResult<()> {
        std::fs::create_dir_all(self.root.join(name))?;
        Ok(())
    }

    fn remove(&self, name: &str) -> PodliteResult<()> {
        self.removed.lock().push(name.to_string());
        Ok(())
    }

    fn mount(&self, name: &str, _mount_id: &str) -> PodliteResult<PathBuf> {
        self.mounts.fetch_add(1, Ordering::SeqCst);
        Ok(self.root.join(name))
    }

    fn unmount(&self, _name: &str, _mount_id: &str) -> PodliteResult<()> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn path(&self, name: &str) -> PodliteResult<PathBuf> {
        Ok(self.root.join(name))
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub struct TestRuntime {
    pub runtime: Runtime,
    pub storage: Arc<FakeStorage>,
    pub network: Arc<FakeNetwork>,
    pub oci: Arc<FakeOci>,
    pub driver: Arc<FakeDriver>,
    pub dir: TempDir,
}

impl TestRuntime {
    pub fn new() -> Self {
        Self::with_capabilities(StaticCapabilities::default())
    }

    pub fn with_capabilities(capabilities: StaticCapabilities) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");

        let resolv = dir.path().join("resolv.conf");
        std::fs::write(&resolv, "nameserver 192.0.2.53\nsearch example.test\n").unwrap();

        let mut options = RuntimeOptions::with_home(&home);
        options.cgroup_manager = CgroupManager::Cgroupfs;
        options.host_resolv_conf = resolv;
        options.host_passwd_file = dir.path().join("passwd");
        options.base_hosts_file = "none".to_string();
        options.num_locks = 64;

        let storage = Arc::new(FakeStorage::new(dir.path().join("layers")));
        let network = Arc::new(FakeNetwork::default());
        let oci = Arc::new(FakeOci::default());
        let driver = Arc::new(FakeDriver::new(dir.path().join("plugin")));

        let collaborators = podlite::runtime::Collaborators::new(storage.clone(), oci.clone())
            .with_network(network.clone())
            .with_volume_driver(driver.clone())
            .with_capabilities(Arc::new(capabilities));

        let runtime = Runtime::new(options, collaborators).unwrap();
        Self {
            runtime,
            storage,
            network,
            oci,
            driver,
            dir,
        }
    }

    pub fn unmounts(&self) -> usize {
        self.storage.unmounts.load(Ordering::SeqCst)
    }

    pub fn db_path(&self) -> PathBuf {
        podlite::runtime::layout::FilesystemLayout::new(self.runtime.options()).db_path()
    }

    pub fn teardowns(&self) -> Vec<Option<PathBuf>> {
        self.network.teardowns.lock().clone()
    }
}
