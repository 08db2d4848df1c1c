//! Container configuration.
//!
//! A configuration is written once when the container is created. Anything
//! that changes during the container's life belongs in
//! [`ContainerState`](super::state::ContainerState).

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use oci_spec::runtime::{LinuxNamespaceType, Spec};
use podlite_shared::errors::{PodliteError, PodliteResult};
use serde::{Deserialize, Serialize};

use crate::lock::LockId;
use crate::runtime::types::{ContainerID, PodID};

/// A named volume attached to a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedVolume {
    pub name: String,
    pub dest: String,
    #[serde(default)]
    pub options: Vec<String>,
    /// Directory inside the volume to mount instead of its root.
    #[serde(default)]
    pub sub_path: Option<String>,
}

/// An ad-hoc overlay on top of a host directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayVolume {
    pub source: PathBuf,
    pub dest: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// An image mounted into the container as a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageVolume {
    pub source: String,
    pub dest: String,
    #[serde(default)]
    pub read_write: bool,
}

/// A secret exposed as a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    /// File name under `/run/secrets`, or an absolute path.
    #[serde(default)]
    pub target: Option<String>,
}

/// The seven namespace kinds a container can own or share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    Mount,
    Network,
    Ipc,
    Pid,
    Uts,
    User,
    Cgroup,
}

impl NamespaceKind {
    pub const ALL: [NamespaceKind; 7] = [
        NamespaceKind::Mount,
        NamespaceKind::Network,
        NamespaceKind::Ipc,
        NamespaceKind::Pid,
        NamespaceKind::Uts,
        NamespaceKind::User,
        NamespaceKind::Cgroup,
    ];

    /// Entry name under `/proc/<pid>/ns`.
    pub fn proc_name(&self) -> &'static str {
        match self {
            NamespaceKind::Mount => "mnt",
            NamespaceKind::Network => "net",
            NamespaceKind::Ipc => "ipc",
            NamespaceKind::Pid => "pid",
            NamespaceKind::Uts => "uts",
            NamespaceKind::User => "user",
            NamespaceKind::Cgroup => "cgroup",
        }
    }

    pub fn oci_type(&self) -> LinuxNamespaceType {
        match self {
            NamespaceKind::Mount => LinuxNamespaceType::Mount,
            NamespaceKind::Network => LinuxNamespaceType::Network,
            NamespaceKind::Ipc => LinuxNamespaceType::Ipc,
            NamespaceKind::Pid => LinuxNamespaceType::Pid,
            NamespaceKind::Uts => LinuxNamespaceType::Uts,
            NamespaceKind::User => LinuxNamespaceType::User,
            NamespaceKind::Cgroup => LinuxNamespaceType::Cgroup,
        }
    }
}

/// Containers whose namespaces this container joins, one per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceRefs {
    pub mount: Option<ContainerID>,
    pub net: Option<ContainerID>,
    pub ipc: Option<ContainerID>,
    pub pid: Option<ContainerID>,
    pub uts: Option<ContainerID>,
    pub user: Option<ContainerID>,
    pub cgroup: Option<ContainerID>,
}

impl NamespaceRefs {
    pub fn get(&self, kind: NamespaceKind) -> Option<&ContainerID> {
        match kind {
            NamespaceKind::Mount => self.mount.as_ref(),
            NamespaceKind::Network => self.net.as_ref(),
            NamespaceKind::Ipc => self.ipc.as_ref(),
            NamespaceKind::Pid => self.pid.as_ref(),
            NamespaceKind::Uts => self.uts.as_ref(),
            NamespaceKind::User => self.user.as_ref(),
            NamespaceKind::Cgroup => self.cgroup.as_ref(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (NamespaceKind, &ContainerID)> {
        NamespaceKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind).map(|id| (kind, id)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Private namespace attached to networks by the network backend.
    #[default]
    Bridge,
    /// Private namespace with loopback only.
    None,
    /// Host network namespace.
    Host,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupsMode {
    #[default]
    Enabled,
    Disabled,
    /// Payload runs in a child of the caller's own cgroup.
    Split,
}

/// One contiguous ID mapping range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMap {
    fn contains_container_id(&self, id: u32) -> bool {
        id >= self.container_id && (id - self.container_id) < self.size
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdMappings {
    pub uid_map: Vec<IdMap>,
    pub gid_map: Vec<IdMap>,
}

fn map_to_host(maps: &[IdMap], id: u32, what: &str) -> PodliteResult<u32> {
    if maps.is_empty() {
        return Ok(id);
    }
    maps.iter()
        .find(|m| m.contains_container_id(id))
        .map(|m| m.host_id + (id - m.container_id))
        .ok_or_else(|| {
            PodliteError::InvalidArgument(format!(
                "container {} {} is not mapped to a host {}",
                what, id, what
            ))
        })
}

impl IdMappings {
    /// Translate a container UID/GID pair into host IDs.
    pub fn host_ids(&self, uid: u32, gid: u32) -> PodliteResult<(u32, u32)> {
        Ok((
            map_to_host(&self.uid_map, uid, "uid")?,
            map_to_host(&self.gid_map, gid, "gid")?,
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub servers: Vec<IpAddr>,
    pub search: Vec<String>,
    pub options: Vec<String>,
}

/// Immutable configuration of a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub id: ContainerID,
    pub name: String,
    pub pod: Option<PodID>,
    pub lock_id: LockId,
    pub created_at: DateTime<Utc>,

    /// Base runtime specification the generator starts from.
    pub spec: Spec,

    pub image_id: Option<String>,
    pub image_name: Option<String>,

    /// `user`, `uid`, `user:group` or `uid:gid`.
    pub user: String,
    pub groups: Vec<String>,
    /// Users looked up in the host passwd file instead of the image's.
    pub host_users: Vec<String>,
    pub add_current_user_passwd_entry: bool,
    /// `Some(false)` disables passwd/group synthesis entirely.
    pub passwd: Option<bool>,
    pub passwd_entry: Option<String>,
    pub umask: Option<String>,

    pub named_volumes: Vec<NamedVolume>,
    pub overlay_volumes: Vec<OverlayVolume>,
    pub image_volumes: Vec<ImageVolume>,

    pub namespaces: NamespaceRefs,
    /// Dependencies beyond the namespace references.
    pub dependencies: Vec<ContainerID>,

    pub network_mode: NetworkMode,
    pub dns: DnsConfig,
    /// Extra hosts entries as `name:ip`.
    pub host_add: Vec<String>,
    pub hostname: Option<String>,
    pub use_image_resolv_conf: bool,
    pub use_image_hosts: bool,

    pub cgroup_parent: String,
    pub cgroups_mode: CgroupsMode,

    pub secrets: Vec<SecretRef>,
    /// Environment variable name to secret name.
    pub env_secrets: BTreeMap<String, String>,
    pub secrets_path: PathBuf,

    pub privileged: bool,
    pub read_only: bool,
    pub create_working_dir: bool,

    pub timezone: Option<String>,
    pub shm_dir: Option<PathBuf>,
    pub chroot_dirs: Vec<String>,
    pub static_dir: PathBuf,
    pub mount_label: Option<String>,
    pub stop_signal: u32,
    pub id_mappings: IdMappings,
    pub seccomp_profile_path: Option<PathBuf>,
}

impl ContainerConfig {
    /// A configuration with a fresh ID and the default runtime spec.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ContainerID::new(),
            name: name.into(),
            created_at: Utc::now(),
            stop_signal: libc::SIGTERM as u32,
            ..Default::default()
        }
    }

    /// Every container this one depends on, without duplicates.
    pub fn all_dependencies(&self) -> Vec<ContainerID> {
        let mut deps: Vec<ContainerID> = Vec::new();
        for id in self
            .namespaces
            .iter()
            .map(|(_, id)| id)
            .chain(self.dependencies.iter())
        {
            if !deps.contains(id) {
                deps.push(id.clone());
            }
        }
        deps
    }

    pub fn work_dir(&self) -> String {
        self.spec
            .process()
            .as_ref()
            .map(|p| p.cwd().to_string_lossy().into_owned())
            .filter(|cwd| !cwd.is_empty())
            .unwrap_or_else(|| "/".to_string())
    }

    /// Whether prepare must create a network namespace for this container.
    pub fn creates_network_namespace(&self) -> bool {
        self.namespaces.net.is_none() && self.network_mode != NetworkMode::Host
    }

    pub fn hostname(&self) -> String {
        match &self.hostname {
            Some(h) if !h.is_empty() => h.clone(),
            _ => self.id.short().to_string(),
        }
    }

    pub fn is_host_user(&self) -> bool {
        !self.user.is_empty() && self.host_users.iter().any(|u| u == &self.user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependencies_are_deduplicated() {
        let dep = ContainerID::new();
        let mut cfg = ContainerConfig::new("web");
        cfg.namespaces.net = Some(dep.clone());
        cfg.namespaces.ipc = Some(dep.clone());
        cfg.dependencies = vec![dep.clone()];

        assert_eq!(cfg.all_dependencies(), vec![dep]);
    }

    #[test]
    fn host_ids_follow_mappings() {
        let mappings = IdMappings {
            uid_map: vec![IdMap { container_id: 0, host_id: 100000, size: 65536 }],
            gid_map: vec![IdMap { container_id: 0, host_id: 200000, size: 65536 }],
        };
        assert_eq!(mappings.host_ids(1000, 10).unwrap(), (101000, 200010));
        assert!(mappings.host_ids(70000, 0).is_err());
        assert_eq!(IdMappings::default().host_ids(5, 6).unwrap(), (5, 6));
    }

    #[test]
    fn hostname_defaults_to_short_id() {
        let cfg = ContainerConfig::new("db");
        assert_eq!(cfg.hostname(), cfg.id.short());
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut cfg = ContainerConfig::new("api");
        cfg.named_volumes.push(NamedVolume {
            name: "data".into(),
            dest: "/data".into(),
            options: vec!["rw".into()],
            sub_path: None,
        });
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ContainerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
