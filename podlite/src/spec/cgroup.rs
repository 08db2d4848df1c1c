//! Cgroup naming per cgroup manager.
//!
//! ```text
//! systemd:   <slice basename>:libpod:<id>        parent must be a .slice
//! cgroupfs:  <parent>/libpod-<id>                parent must not be a .slice
//! split:     <own cgroup>/libpod-payload-<id>    independent of the manager
//! ```

use std::path::Path;

use podlite_shared::errors::{PodliteError, PodliteResult};
use serde::{Deserialize, Serialize};

use crate::caps::HostCapabilities;
use crate::container::config::{CgroupsMode, ContainerConfig};
use crate::runtime::types::PodID;

const SYSTEMD_DEFAULT_PARENT: &str = "machine.slice";
const SYSTEMD_ROOTLESS_DEFAULT_PARENT: &str = "user.slice";
const CGROUPFS_DEFAULT_PARENT: &str = "/libpod_parent";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupManager {
    #[default]
    Systemd,
    Cgroupfs,
}

impl CgroupManager {
    pub fn default_parent(self, rootless: bool) -> &'static str {
        match self {
            CgroupManager::Systemd if rootless => SYSTEMD_ROOTLESS_DEFAULT_PARENT,
            CgroupManager::Systemd => SYSTEMD_DEFAULT_PARENT,
            CgroupManager::Cgroupfs => CGROUPFS_DEFAULT_PARENT,
        }
    }

    /// Default an empty parent and reject one the manager cannot use.
    pub fn validate_parent(self, parent: &str, rootless: bool) -> PodliteResult<String> {
        if parent.is_empty() {
            return Ok(self.default_parent(rootless).to_string());
        }
        match self {
            CgroupManager::Systemd if !parent.ends_with(".slice") => {
                Err(PodliteError::InvalidArgument(format!(
                    "did not receive systemd slice as cgroup parent when using systemd to manage cgroups: {}",
                    parent
                )))
            }
            CgroupManager::Cgroupfs if parent.ends_with(".slice") => {
                Err(PodliteError::InvalidArgument(format!(
                    "systemd slice received as cgroup parent when using cgroupfs: {}",
                    parent
                )))
            }
            _ => Ok(parent.to_string()),
        }
    }

    /// The cgroups path to put in the runtime spec, `None` for no cgroup.
    pub fn container_path(
        self,
        config: &ContainerConfig,
        caps: &dyn HostCapabilities,
    ) -> PodliteResult<Option<String>> {
        match config.cgroups_mode {
            CgroupsMode::Disabled => return Ok(None),
            CgroupsMode::Split => {
                let own = caps.own_cgroup()?;
                if own == "/" {
                    return Err(PodliteError::InvalidArgument(
                        "cannot use the root cgroup for a split cgroup payload".into(),
                    ));
                }
                return Ok(Some(join_cgroup(&own, &format!("libpod-payload-{}", config.id))));
            }
            CgroupsMode::Enabled => {}
        }

        match self {
            CgroupManager::Systemd => {
                let parent = self.validate_parent(&config.cgroup_parent, caps.is_rootless())?;
                Ok(Some(format!("{}:libpod:{}", base_name(&parent), config.id)))
            }
            CgroupManager::Cgroupfs => {
                if caps.is_rootless()
                    && (config.cgroup_parent.is_empty()
                        || config.cgroup_parent == CGROUPFS_DEFAULT_PARENT)
                {
                    return Ok(None);
                }
                let parent = self.validate_parent(&config.cgroup_parent, caps.is_rootless())?;
                Ok(Some(join_cgroup(&parent, &format!("libpod-{}", config.id))))
            }
        }
    }

    /// Cgroup created for a pod, to be used as its members' parent.
    pub fn pod_path(self, parent: &str, pod: &PodID, rootless: bool) -> PodliteResult<String> {
        let parent = self.validate_parent(parent, rootless)?;
        Ok(match self {
            CgroupManager::Systemd => {
                let stem = base_name(&parent).trim_end_matches(".slice");
                if stem.is_empty() || stem == "-" {
                    format!("libpod_pod_{}.slice", pod)
                } else {
                    format!("{}-libpod_pod_{}.slice", stem, pod)
                }
            }
            CgroupManager::Cgroupfs => join_cgroup(&parent, pod.as_str()),
        })
    }

    /// Where a cgroup path lives under the cgroup v2 mount.
    pub fn host_dir(self, cgroup_root: &Path, path: &str) -> PodliteResult<std::path::PathBuf> {
        let relative = match self {
            CgroupManager::Systemd if path.ends_with(".slice") => expand_slice(path)?,
            _ => path.trim_start_matches('/').to_string(),
        };
        Ok(cgroup_root.join(relative))
    }
}

/// Expand a slice unit name into its nested directory path:
/// `a-b-c.slice` becomes `a.slice/a-b.slice/a-b-c.slice`.
pub fn expand_slice(slice: &str) -> PodliteResult<String> {
    let stem = slice.strip_suffix(".slice").ok_or_else(|| {
        PodliteError::InvalidArgument(format!("{} is not a slice", slice))
    })?;
    if stem.contains('/') {
        return Err(PodliteError::InvalidArgument(format!("invalid slice name {}", slice)));
    }
    if stem == "-" || stem.is_empty() {
        return Ok(String::new());
    }

    let mut path = Vec::new();
    let mut prefix = String::new();
    for component in stem.split('-') {
        if component.is_empty() {
            return Err(PodliteError::InvalidArgument(format!("invalid slice name {}", slice)));
        }
        if !prefix.is_empty() {
            prefix.push('-');
        }
        prefix.push_str(component);
        path.push(format!("{}.slice", prefix));
    }
    Ok(path.join("/"))
}

/// Remove a cgroup directory; an already-missing one is fine.
pub fn remove_cgroup_dir(dir: &Path) -> PodliteResult<()> {
    match std::fs::remove_dir(dir) {
        Ok(()) => {
            tracing::debug!(path = %dir.display(), "cgroup removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PodliteError::Storage(format!(
            "failed to remove cgroup at {}: {}",
            dir.display(),
            e
        ))),
    }
}

fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

fn join_cgroup(parent: &str, child: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), child)
}
