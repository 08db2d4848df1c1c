//! Runtime configuration.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use podlite_shared::errors::{PodliteError, PodliteResult};
use serde::{Deserialize, Serialize};

use crate::spec::cgroup::CgroupManager;

/// Directory name under the user's home used when no home is configured.
const DEFAULT_HOME_DIRNAME: &str = ".podlite";

const DEFAULT_NUM_LOCKS: u32 = 2048;

/// Options controlling where the engine keeps its data and how it
/// fills in container defaults.
///
/// Every path derived from `home_dir` can be overridden individually. The
/// store records the path fields on first use and refuses to open with
/// different values later.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    pub home_dir: PathBuf,
    /// Persistent per-container data (bind-mount sources, overlay content dirs).
    pub static_dir: PathBuf,
    /// Scratch data that does not survive a reboot.
    pub tmp_dir: PathBuf,
    pub graph_root: PathBuf,
    pub run_root: PathBuf,
    pub graph_driver: String,
    /// Parent directory of local volume data.
    pub volume_path: PathBuf,

    pub cgroup_manager: CgroupManager,

    /// Nameservers used when a container declares none.
    pub dns_servers: Vec<IpAddr>,
    pub dns_searches: Vec<String>,
    pub dns_options: Vec<String>,

    /// Base content for generated hosts files. Empty means the image's
    /// own `/etc/hosts`, `none` means start from nothing.
    pub base_hosts_file: String,
    pub host_resolv_conf: PathBuf,
    pub host_passwd_file: PathBuf,
    pub host_localtime: PathBuf,
    pub zoneinfo_dir: PathBuf,
    /// `src:dst` lines describing subscription mounts.
    pub default_mounts_file: Option<PathBuf>,

    pub seccomp_profile_required: bool,
    pub default_seccomp_profile: Option<PathBuf>,

    /// Number of entity locks the lock manager may hand out.
    pub num_locks: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        let home = dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(DEFAULT_HOME_DIRNAME);
        Self::with_home(home)
    }
}

impl RuntimeOptions {
    /// Options with every path rooted at `home`.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            static_dir: home.join("storage").join("libpod"),
            tmp_dir: home.join("tmp"),
            graph_root: home.join("storage"),
            run_root: home.join("run"),
            graph_driver: "overlay".to_string(),
            volume_path: home.join("storage").join("volumes"),
            home_dir: home,
            cgroup_manager: CgroupManager::default(),
            dns_servers: Vec::new(),
            dns_searches: Vec::new(),
            dns_options: Vec::new(),
            base_hosts_file: String::new(),
            host_resolv_conf: PathBuf::from("/etc/resolv.conf"),
            host_passwd_file: PathBuf::from("/etc/passwd"),
            host_localtime: PathBuf::from("/etc/localtime"),
            zoneinfo_dir: PathBuf::from("/usr/share/zoneinfo"),
            default_mounts_file: None,
            seccomp_profile_required: false,
            default_seccomp_profile: None,
            num_locks: DEFAULT_NUM_LOCKS,
        }
    }

    /// Load options from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> PodliteResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PodliteError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            PodliteError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_home_derives_paths() {
        let opts = RuntimeOptions::with_home("/srv/podlite");
        assert_eq!(opts.static_dir, PathBuf::from("/srv/podlite/storage/libpod"));
        assert_eq!(opts.run_root, PathBuf::from("/srv/podlite/run"));
        assert_eq!(opts.graph_driver, "overlay");
    }

    #[test]
    fn from_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("podlite.json");
        std::fs::write(
            &path,
            r#"{"home_dir": "/srv/x", "cgroup_manager": "cgroupfs", "dns_servers": ["1.1.1.1"]}"#,
        )
        .unwrap();

        let opts = RuntimeOptions::from_file(&path).unwrap();
        assert_eq!(opts.home_dir, PathBuf::from("/srv/x"));
        assert_eq!(opts.cgroup_manager, CgroupManager::Cgroupfs);
        assert_eq!(opts.dns_servers.len(), 1);
        assert_eq!(opts.host_resolv_conf, PathBuf::from("/etc/resolv.conf"));
    }

    #[test]
    fn from_file_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            RuntimeOptions::from_file(&path),
            Err(PodliteError::Config(_))
        ));
    }
}
