//! Volume configuration and state.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use podlite_shared::errors::{PodliteError, PodliteResult};
use serde::{Deserialize, Serialize};

use crate::lock::LockId;

/// Driver name for volumes managed by the engine itself.
pub const LOCAL_DRIVER: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub name: String,
    pub driver: String,
    pub lock_id: LockId,
    pub created_at: DateTime<Utc>,
    /// Host directory backing a local volume.
    pub mount_point: PathBuf,
    /// Local: `type`, `device`, `o` for mount(2). Plugins: passed through.
    pub options: BTreeMap<String, String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Storage container backing this volume, if any.
    pub storage_id: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            driver: LOCAL_DRIVER.to_string(),
            lock_id: LockId::default(),
            created_at: Utc::now(),
            mount_point: PathBuf::new(),
            options: BTreeMap::new(),
            uid: None,
            gid: None,
            storage_id: None,
            labels: BTreeMap::new(),
        }
    }
}

impl VolumeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn uses_driver(&self) -> bool {
        self.driver != LOCAL_DRIVER
    }

    /// Local volumes with mount options need an explicit mount(2).
    pub fn needs_mount(&self) -> bool {
        self.uses_driver() || self.options.contains_key("type") || self.options.contains_key("device")
    }

    pub fn validate(&self) -> PodliteResult<()> {
        if self.name.is_empty() {
            return Err(PodliteError::InvalidArgument("volume name must not be empty".into()));
        }
        if let Some((key, _)) = self.options.iter().find(|(_, v)| v.is_empty()) {
            return Err(PodliteError::InvalidArgument(format!(
                "volume {} option {} has an empty value",
                self.name, key
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeState {
    /// Number of containers currently using the mount.
    pub mount_count: u32,
    /// Where a plugin reported the volume mounted.
    pub mount_point: Option<PathBuf>,
    pub needs_chown: bool,
    pub uid_chowned: Option<u32>,
    pub gid_chowned: Option<u32>,
}

impl VolumeState {
    pub fn reset_for_refresh(&mut self, uses_driver: bool) {
        self.mount_count = 0;
        if uses_driver {
            self.mount_point = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_option_value_is_rejected() {
        let mut cfg = VolumeConfig::new("data");
        cfg.options.insert("o".into(), String::new());
        assert!(matches!(cfg.validate(), Err(PodliteError::InvalidArgument(_))));
    }

    #[test]
    fn local_without_options_needs_no_mount() {
        let mut cfg = VolumeConfig::new("data");
        assert!(!cfg.needs_mount());
        cfg.options.insert("type".into(), "tmpfs".into());
        assert!(cfg.needs_mount());
    }
}
