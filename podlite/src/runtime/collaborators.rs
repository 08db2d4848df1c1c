//! Boundaries to the systems the engine drives but does not implement.
//!
//! The runtime owns one [`Collaborators`] set. Every trait is synchronous:
//! implementations block until the external system answers.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use oci_spec::runtime::{Hook, Spec};
use podlite_shared::errors::{PodliteError, PodliteResult};

use crate::caps::{HostCapabilities, SystemCapabilities};
use crate::container::config::ContainerConfig;
use crate::container::state::NetworkStatus;

/// Result of setting up a container's network.
#[derive(Debug, Clone, Default)]
pub struct NetworkSetup {
    /// Path of the created network namespace, if one was created.
    pub netns: Option<PathBuf>,
    /// Per-network status keyed by network name.
    pub status: BTreeMap<String, NetworkStatus>,
}

/// Creates and destroys network namespaces and attaches them to networks.
pub trait NetworkBackend: Send + Sync {
    fn setup(&self, config: &ContainerConfig) -> PodliteResult<NetworkSetup>;

    /// Detach and destroy. Must succeed as a no-op when `netns` is `None`.
    fn teardown(&self, config: &ContainerConfig, netns: Option<&Path>) -> PodliteResult<()>;
}

/// Mounts a container's root filesystem.
pub trait StorageBackend: Send + Sync {
    /// Mount the root filesystem and return the mountpoint.
    fn mount(&self, config: &ContainerConfig) -> PodliteResult<PathBuf>;

    fn unmount(&self, config: &ContainerConfig, force: bool) -> PodliteResult<()>;
}

/// A volume plugin.
pub trait VolumeDriver: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self, name: &str, options: &BTreeMap<String, String>) -> PodliteResult<()>;

    /// Remove a volume. A not-found error means the plugin already lost it.
    fn remove(&self, name: &str) -> PodliteResult<()>;

    /// Mount for the caller identified by `mount_id`; returns the host path.
    fn mount(&self, name: &str, mount_id: &str) -> PodliteResult<PathBuf>;

    fn unmount(&self, name: &str, mount_id: &str) -> PodliteResult<()>;

    fn path(&self, name: &str) -> PodliteResult<PathBuf>;
}

pub trait SecretsManager: Send + Sync {
    fn lookup_secret_data(&self, name: &str) -> PodliteResult<Vec<u8>>;
}

/// Runs precreate hooks, which may edit the spec, and reports the hooks to
/// register for later lifecycle stages.
pub trait HookRunner: Send + Sync {
    fn precreate(&self, spec: &mut Spec) -> PodliteResult<BTreeMap<String, Vec<Hook>>>;
}

/// Mounts an image for use as a volume source.
pub trait ImageMounter: Send + Sync {
    fn mount_image(&self, reference: &str) -> PodliteResult<PathBuf>;
}

/// The OCI runtime, used here only to stop containers before removal.
pub trait OciRuntime: Send + Sync {
    fn stop(
        &self,
        config: &ContainerConfig,
        pid: Option<i32>,
        timeout: Option<Duration>,
    ) -> PodliteResult<()>;
}

/// Network backend that never creates namespaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNetwork;

impl NetworkBackend for NoNetwork {
    fn setup(&self, config: &ContainerConfig) -> PodliteResult<NetworkSetup> {
        tracing::debug!(container_id = %config.id, "no network backend, skipping network setup");
        Ok(NetworkSetup::default())
    }

    fn teardown(&self, _config: &ContainerConfig, _netns: Option<&Path>) -> PodliteResult<()> {
        Ok(())
    }
}

/// Hook runner with no hooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl HookRunner for NoopHooks {
    fn precreate(&self, _spec: &mut Spec) -> PodliteResult<BTreeMap<String, Vec<Hook>>> {
        Ok(BTreeMap::new())
    }
}

/// Everything the runtime delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub network: Arc<dyn NetworkBackend>,
    pub storage: Arc<dyn StorageBackend>,
    pub volume_drivers: HashMap<String, Arc<dyn VolumeDriver>>,
    pub secrets: Option<Arc<dyn SecretsManager>>,
    pub hooks: Arc<dyn HookRunner>,
    pub images: Option<Arc<dyn ImageMounter>>,
    pub oci: Arc<dyn OciRuntime>,
    pub capabilities: Arc<dyn HostCapabilities>,
}

impl Collaborators {
    /// Storage and the OCI runtime are required; everything else has a default.
    pub fn new(storage: Arc<dyn StorageBackend>, oci: Arc<dyn OciRuntime>) -> Self {
        Self {
            network: Arc::new(NoNetwork),
            storage,
            volume_drivers: HashMap::new(),
            secrets: None,
            hooks: Arc::new(NoopHooks),
            images: None,
            oci,
            capabilities: Arc::new(SystemCapabilities),
        }
    }

    pub fn with_network(mut self, network: Arc<dyn NetworkBackend>) -> Self {
        self.network = network;
        self
    }

    pub fn with_volume_driver(mut self, driver: Arc<dyn VolumeDriver>) -> Self {
        self.volume_drivers.insert(driver.name().to_string(), driver);
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretsManager>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn HookRunner>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_images(mut self, images: Arc<dyn ImageMounter>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Arc<dyn HostCapabilities>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn volume_driver(&self, name: &str) -> PodliteResult<Arc<dyn VolumeDriver>> {
        self.volume_drivers
            .get(name)
            .cloned()
            .ok_or_else(|| PodliteError::NotFound(format!("volume driver {}", name)))
    }

    pub fn secrets(&self) -> PodliteResult<&Arc<dyn SecretsManager>> {
        self.secrets
            .as_ref()
            .ok_or_else(|| PodliteError::Config("no secrets manager configured".into()))
    }

    pub fn images(&self) -> PodliteResult<&Arc<dyn ImageMounter>> {
        self.images
            .as_ref()
            .ok_or_else(|| PodliteError::Config("no image mounter configured".into()))
    }
}
