//! Namespace wiring for the generated spec.

use std::path::PathBuf;

use oci_spec::runtime::{LinuxNamespace, LinuxNamespaceBuilder, LinuxNamespaceType, Spec};
use podlite_shared::errors::{PodliteError, PodliteResult};

use crate::caps::HostCapabilities;
use crate::container::config::{ContainerConfig, NamespaceKind, NetworkMode};
use crate::container::state::ContainerState;
use crate::runtime::types::ContainerID;

pub(crate) fn namespaces(spec: &Spec) -> Vec<LinuxNamespace> {
    spec.linux()
        .as_ref()
        .and_then(|l| l.namespaces().clone())
        .unwrap_or_default()
}

fn set_namespaces(spec: &mut Spec, namespaces: Vec<LinuxNamespace>) {
    let mut linux = spec.linux().clone().unwrap_or_default();
    linux.set_namespaces(Some(namespaces));
    spec.set_linux(Some(linux));
}

/// Add or replace the namespace of kind `typ`. `None` asks for a new one.
fn put(
    list: &mut Vec<LinuxNamespace>,
    typ: LinuxNamespaceType,
    path: Option<PathBuf>,
) -> PodliteResult<()> {
    let mut builder = LinuxNamespaceBuilder::default().typ(typ);
    if let Some(path) = path {
        builder = builder.path(path);
    }
    let ns = builder.build()?;
    match list.iter_mut().find(|n| n.typ() == typ) {
        Some(existing) => *existing = ns,
        None => list.push(ns),
    }
    Ok(())
}

/// Path of namespace `kind` owned by a dependency container.
fn dependency_path(
    kind: NamespaceKind,
    dep: &ContainerID,
    dep_state: &ContainerState,
) -> PodliteResult<PathBuf> {
    if kind == NamespaceKind::Network
        && let Some(netns) = &dep_state.net_ns
    {
        return Ok(netns.clone());
    }
    let pid = dep_state.pid.filter(|p| *p > 0).ok_or_else(|| {
        PodliteError::InvalidState(format!(
            "cannot join {} namespace of container {}: it is not running",
            kind.proc_name(),
            dep
        ))
    })?;
    Ok(PathBuf::from(format!("/proc/{}/ns/{}", pid, kind.proc_name())))
}

/// Join dependency namespaces and wire up the container's own network namespace.
pub(crate) fn configure(
    spec: &mut Spec,
    config: &ContainerConfig,
    state: &ContainerState,
    dependency_state: &dyn Fn(&ContainerID) -> PodliteResult<ContainerState>,
) -> PodliteResult<()> {
    let mut list = namespaces(spec);

    for (kind, dep) in config.namespaces.iter() {
        let dep_state = dependency_state(dep)?;
        let path = dependency_path(kind, dep, &dep_state)?;
        tracing::debug!(container_id = %config.id, dependency = %dep, kind = kind.proc_name(), "joining namespace");
        put(&mut list, kind.oci_type(), Some(path))?;
    }

    if config.namespaces.net.is_none() {
        if config.network_mode == NetworkMode::Host {
            list.retain(|n| n.typ() != LinuxNamespaceType::Network);
        } else {
            put(&mut list, LinuxNamespaceType::Network, state.net_ns.clone())?;
        }
    }

    set_namespaces(spec, list);
    Ok(())
}

/// Set the hostname when the container owns its UTS namespace and export it
/// as `HOSTNAME` unless the user already did.
pub(crate) fn configure_hostname(
    spec: &mut Spec,
    config: &ContainerConfig,
    caps: &dyn HostCapabilities,
) -> PodliteResult<()> {
    let owns_uts = namespaces(spec)
        .iter()
        .any(|n| n.typ() == LinuxNamespaceType::Uts && n.path().is_none());
    let hostname = if owns_uts {
        let hostname = config.hostname();
        spec.set_hostname(Some(hostname.clone()));
        hostname
    } else {
        // Only a private UTS namespace can carry a hostname.
        spec.set_hostname(None);
        caps.hostname()?
    };
    super::add_env_if_missing(spec, "HOSTNAME", &hostname);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::StaticCapabilities;

    fn kinds(spec: &Spec) -> Vec<(LinuxNamespaceType, Option<PathBuf>)> {
        namespaces(spec)
            .into_iter()
            .map(|n| (n.typ(), n.path().clone()))
            .collect()
    }

    #[test]
    fn joins_dependency_namespaces() {
        let dep = ContainerID::new();
        let mut config = ContainerConfig::new("c");
        config.namespaces.net = Some(dep.clone());
        config.namespaces.ipc = Some(dep.clone());
        let mut spec = Spec::default();

        let dep_state = ContainerState {
            pid: Some(4242),
            net_ns: Some(PathBuf::from("/run/netns/podlite-1")),
            ..Default::default()
        };
        configure(&mut spec, &config, &ContainerState::default(), &|_| Ok(dep_state.clone())).unwrap();

        let found = kinds(&spec);
        assert!(found.contains(&(LinuxNamespaceType::Network, Some("/run/netns/podlite-1".into()))));
        assert!(found.contains(&(LinuxNamespaceType::Ipc, Some("/proc/4242/ns/ipc".into()))));
    }

    #[test]
    fn stopped_dependency_is_an_error() {
        let mut config = ContainerConfig::new("c");
        config.namespaces.pid = Some(ContainerID::new());
        let mut spec = Spec::default();
        let err = configure(&mut spec, &config, &ContainerState::default(), &|_| {
            Ok(ContainerState::default())
        })
        .unwrap_err();
        assert!(matches!(err, PodliteError::InvalidState(_)));
    }

    #[test]
    fn host_network_drops_namespace() {
        let mut config = ContainerConfig::new("c");
        config.network_mode = NetworkMode::Host;
        let mut spec = Spec::default();
        configure(&mut spec, &config, &ContainerState::default(), &|_| unreachable!()).unwrap();
        assert!(!kinds(&spec).iter().any(|(t, _)| *t == LinuxNamespaceType::Network));

        config.network_mode = NetworkMode::Bridge;
        let state = ContainerState {
            net_ns: Some("/run/netns/own".into()),
            ..Default::default()
        };
        configure(&mut spec, &config, &state, &|_| unreachable!()).unwrap();
        assert!(kinds(&spec).contains(&(LinuxNamespaceType::Network, Some("/run/netns/own".into()))));
    }

    #[test]
    fn hostname_follows_uts_ownership() {
        let mut config = ContainerConfig::new("c");
        config.hostname = Some("box".into());
        let caps = StaticCapabilities { hostname: "hosty".into(), ..Default::default() };

        let mut spec = Spec::default();
        let mut list = namespaces(&spec);
        put(&mut list, LinuxNamespaceType::Uts, None).unwrap();
        set_namespaces(&mut spec, list);
        configure_hostname(&mut spec, &config, &caps).unwrap();
        assert_eq!(spec.hostname().as_deref(), Some("box"));
        assert_eq!(super::super::env_value(&spec, "HOSTNAME").as_deref(), Some("box"));

        let mut spec = Spec::default();
        let mut list = namespaces(&spec);
        list.retain(|n| n.typ() != LinuxNamespaceType::Uts);
        set_namespaces(&mut spec, list);
        configure_hostname(&mut spec, &config, &caps).unwrap();
        assert_eq!(super::super::env_value(&spec, "HOSTNAME").as_deref(), Some("hosty"));
        assert!(spec.hostname().is_none());
    }
}
