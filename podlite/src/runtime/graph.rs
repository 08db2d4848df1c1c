//! Dependency graph between containers.
//!
//! Built from configurations for one operation and dropped afterwards. Nodes
//! hold IDs only; callers fetch whatever they need again through the store.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use podlite_shared::errors::{PodliteError, PodliteResult};

use crate::container::config::ContainerConfig;
use crate::runtime::types::ContainerID;

#[derive(Debug, Default)]
struct Node {
    /// Containers this one depends on, within the graph.
    depends_on: BTreeSet<ContainerID>,
    /// Containers depending on this one.
    dependents: BTreeSet<ContainerID>,
}

#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<ContainerID, Node>,
    /// Containers nothing in the graph depends on.
    not_depended_on: BTreeSet<ContainerID>,
}

impl DependencyGraph {
    /// Build the graph of `configs`. Dependencies on containers outside the
    /// set are ignored.
    pub fn build<'a>(configs: impl IntoIterator<Item = &'a ContainerConfig>) -> Self {
        let configs: Vec<&ContainerConfig> = configs.into_iter().collect();
        let mut nodes: BTreeMap<ContainerID, Node> = configs
            .iter()
            .map(|c| (c.id.clone(), Node::default()))
            .collect();

        for config in &configs {
            for dep in config.all_dependencies() {
                if dep == config.id || !nodes.contains_key(&dep) {
                    continue;
                }
                if let Some(node) = nodes.get_mut(&config.id) {
                    node.depends_on.insert(dep.clone());
                }
                if let Some(node) = nodes.get_mut(&dep) {
                    node.dependents.insert(config.id.clone());
                }
            }
        }

        let not_depended_on = nodes
            .iter()
            .filter(|(_, n)| n.dependents.is_empty())
            .map(|(id, _)| id.clone())
            .collect();

        Self {
            nodes,
            not_depended_on,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Order in which containers can be removed: every container comes
    /// before the containers it depends on.
    pub fn removal_order(&self) -> PodliteResult<Vec<ContainerID>> {
        let mut remaining: BTreeMap<&ContainerID, usize> = self
            .nodes
            .iter()
            .map(|(id, n)| (id, n.dependents.len()))
            .collect();
        let mut queue: VecDeque<&ContainerID> = self.not_depended_on.iter().collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.clone());
            let Some(node) = self.nodes.get(id) else { continue };
            for dep in &node.depends_on {
                if let Some(count) = remaining.get_mut(dep) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(dep);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(PodliteError::InvalidState(format!(
                "dependency cycle among {} containers",
                self.nodes.len() - order.len()
            )));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(order: &[ContainerID], id: &ContainerID) -> usize {
        order.iter().position(|x| x == id).unwrap()
    }

    #[test]
    fn dependents_are_removed_first() {
        let infra = ContainerConfig::new("infra");
        let mut app = ContainerConfig::new("app");
        app.namespaces.net = Some(infra.id.clone());
        let mut sidecar = ContainerConfig::new("sidecar");
        sidecar.namespaces.ipc = Some(infra.id.clone());
        sidecar.dependencies.push(app.id.clone());

        let graph = DependencyGraph::build([&infra, &app, &sidecar]);
        assert_eq!(graph.len(), 3);
        let order = graph.removal_order().unwrap();
        assert!(position(&order, &sidecar.id) < position(&order, &app.id));
        assert!(position(&order, &app.id) < position(&order, &infra.id));
    }

    #[test]
    fn outside_dependencies_are_ignored() {
        let mut a = ContainerConfig::new("a");
        a.dependencies.push(ContainerID::new());
        let graph = DependencyGraph::build([&a]);
        assert_eq!(graph.removal_order().unwrap(), vec![a.id.clone()]);
    }

    #[test]
    fn cycles_are_rejected() {
        let mut a = ContainerConfig::new("a");
        let mut b = ContainerConfig::new("b");
        a.dependencies.push(b.id.clone());
        b.dependencies.push(a.id.clone());
        let graph = DependencyGraph::build([&a, &b]);
        assert!(matches!(graph.removal_order(), Err(PodliteError::InvalidState(_))));
    }
}
