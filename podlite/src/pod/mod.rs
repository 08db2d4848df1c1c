//! Pod configuration and state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::container::config::NamespaceKind;
use crate::lock::LockId;
use crate::runtime::types::{ContainerID, PodID};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodConfig {
    pub id: PodID,
    pub name: String,
    pub lock_id: LockId,
    pub created_at: DateTime<Utc>,
    pub cgroup_parent: String,
    /// Whether the pod gets its own cgroup that members are placed under.
    pub uses_cgroup: bool,
    pub has_infra: bool,
    /// Namespaces members share through the infra container.
    pub shared_namespaces: Vec<NamespaceKind>,
}

impl PodConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: PodID::new(),
            name: name.into(),
            created_at: Utc::now(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodState {
    pub cgroup_path: Option<String>,
    pub infra_container_id: Option<ContainerID>,
}

impl PodState {
    pub fn reset_for_refresh(&mut self) {
        self.cgroup_path = None;
    }
}
