//! Container lifecycle status and mutable state.
//!
//! State is a cache of the persisted record. Callers refresh it from the
//! store before trusting it and save it explicitly after changing it, both
//! while holding the container's lock.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use oci_spec::runtime::Hook;
use podlite_shared::errors::{PodliteError, PodliteResult};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Cannot determine state (error recovery).
    #[default]
    Unknown,
    /// Created in the store, nothing prepared on the host yet.
    Configured,
    /// The OCI runtime has created the container but not started it.
    Created,
    Running,
    Stopped,
    Paused,
    /// Exited and its exit code recorded.
    Exited,
    /// Removal in progress.
    Removing,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }

    /// Running or paused: the container's processes exist.
    pub fn is_active(&self) -> bool {
        matches!(self, ContainerStatus::Running | ContainerStatus::Paused)
    }

    /// Whether the container has never been initialized since it was created
    /// (or since a reboot).
    pub fn is_initial(&self) -> bool {
        matches!(self, ContainerStatus::Configured | ContainerStatus::Unknown)
    }

    pub fn can_transition_to(&self, target: ContainerStatus) -> bool {
        use ContainerStatus::*;
        matches!(
            (self, target),
            (Unknown, _)
                | (_, Removing)
                | (_, Unknown)
                | (Configured, Created)
                | (Created, Running)
                | (Created, Stopped)
                | (Running, Paused)
                | (Running, Stopped)
                | (Running, Exited)
                | (Paused, Running)
                | (Stopped, Exited)
                | (Stopped, Created)
                | (Exited, Created)
                | (Exited, Configured)
                | (Stopped, Configured)
        )
    }

    /// Integer stored in the `ContainerState.State` column.
    pub fn as_i32(&self) -> i32 {
        match self {
            ContainerStatus::Unknown => 0,
            ContainerStatus::Configured => 1,
            ContainerStatus::Created => 2,
            ContainerStatus::Running => 3,
            ContainerStatus::Stopped => 4,
            ContainerStatus::Paused => 5,
            ContainerStatus::Exited => 6,
            ContainerStatus::Removing => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Unknown => "unknown",
            ContainerStatus::Configured => "configured",
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Removing => "removing",
        }
    }
}

impl std::str::FromStr for ContainerStatus {
    type Err = PodliteError;

    fn from_str(s: &str) -> PodliteResult<Self> {
        Ok(match s {
            "unknown" => ContainerStatus::Unknown,
            "configured" => ContainerStatus::Configured,
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "stopped" => ContainerStatus::Stopped,
            "paused" => ContainerStatus::Paused,
            "exited" => ContainerStatus::Exited,
            "removing" => ContainerStatus::Removing,
            other => {
                return Err(PodliteError::InvalidArgument(format!(
                    "invalid container status: {}",
                    other
                )));
            }
        })
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An address assigned on one interface, in CIDR notation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetAddress {
    pub ipnet: String,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
}

impl NetAddress {
    pub fn ip(&self) -> Option<IpAddr> {
        self.ipnet.split('/').next().and_then(|ip| ip.parse().ok())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetInterface {
    pub mac_address: String,
    pub subnets: Vec<NetAddress>,
}

/// Result of attaching a container to one network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkStatus {
    pub interfaces: BTreeMap<String, NetInterface>,
    pub dns_server_ips: Vec<IpAddr>,
    pub dns_search_domains: Vec<String>,
}

impl NetworkStatus {
    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.interfaces
            .values()
            .flat_map(|iface| iface.subnets.iter())
            .filter_map(NetAddress::ip)
    }
}

/// Mutable state of a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerState {
    pub status: ContainerStatus,
    pub exit_code: i32,
    pub pid: Option<i32>,
    pub mountpoint: Option<PathBuf>,
    pub mounted: bool,
    pub run_dir: PathBuf,
    pub net_ns: Option<PathBuf>,
    /// Per-network status keyed by network name.
    pub network_status: BTreeMap<String, NetworkStatus>,
    /// Container path to host path for every generated bind mount.
    pub bind_mounts: BTreeMap<String, String>,
    pub cgroup_path: Option<String>,
    pub extension_stage_hooks: BTreeMap<String, Vec<Hook>>,
    pub pinned_ns_dir: Option<PathBuf>,
    pub restart_count: u32,
    pub stopped_by_user: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ContainerState {
    pub fn new(run_dir: PathBuf) -> Self {
        Self {
            status: ContainerStatus::Configured,
            run_dir,
            ..Default::default()
        }
    }

    /// Clear everything that refers to host resources from a previous boot.
    pub fn reset_for_refresh(&mut self) {
        if self.status != ContainerStatus::Exited {
            self.status = ContainerStatus::Configured;
        }
        self.pid = None;
        self.mountpoint = None;
        self.mounted = false;
        self.net_ns = None;
        self.network_status.clear();
        self.bind_mounts.clear();
        self.restart_count = 0;
        self.stopped_by_user = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ContainerStatus::Unknown,
            ContainerStatus::Configured,
            ContainerStatus::Running,
            ContainerStatus::Exited,
        ] {
            assert_eq!(status.as_str().parse::<ContainerStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<ContainerStatus>().is_err());
    }

    #[test]
    fn test_transitions() {
        assert!(ContainerStatus::Configured.can_transition_to(ContainerStatus::Created));
        assert!(ContainerStatus::Running.can_transition_to(ContainerStatus::Paused));
        assert!(!ContainerStatus::Configured.can_transition_to(ContainerStatus::Running));
    }

    #[test]
    fn test_reset_for_refresh() {
        let mut state = ContainerState::new(PathBuf::from("/run/ctr"));
        state.status = ContainerStatus::Running;
        state.pid = Some(42);
        state.mounted = true;
        state.mountpoint = Some(PathBuf::from("/mnt/ctr"));
        state.net_ns = Some(PathBuf::from("/run/netns/x"));
        state.network_status.insert("podman".into(), NetworkStatus::default());
        state.bind_mounts.insert("/etc/hosts".into(), "/run/ctr/hosts".into());

        state.reset_for_refresh();

        assert_eq!(state.status, ContainerStatus::Configured);
        assert_eq!(state.pid, None);
        assert!(!state.mounted);
        assert!(state.net_ns.is_none());
        assert!(state.network_status.is_empty());
        assert!(state.bind_mounts.is_empty());
    }

    #[test]
    fn test_exited_survives_refresh() {
        let mut state = ContainerState::new(PathBuf::new());
        state.status = ContainerStatus::Exited;
        state.reset_for_refresh();
        assert_eq!(state.status, ContainerStatus::Exited);
    }

    #[test]
    fn test_net_address_ip() {
        let addr = NetAddress { ipnet: "10.88.0.5/16".into(), gateway: None };
        assert_eq!(addr.ip(), Some("10.88.0.5".parse().unwrap()));
    }
}
