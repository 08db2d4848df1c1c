//! `/etc/hosts` generation.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use podlite_shared::errors::{PodliteError, PodliteResult};

use crate::container::config::ContainerConfig;
use crate::container::state::NetworkStatus;
use crate::fs::secure_join;
use crate::lock::PathLock;

/// Base file setting that starts the hosts file empty.
pub(crate) const BASE_HOSTS_NONE: &str = "none";

const HOST_GATEWAY_NAMES: &str = "host.containers.internal host.docker.internal";

const DEFAULT_LOCALHOST: &[&str] = &[
    "127.0.0.1\tlocalhost localhost.localdomain localhost4 localhost4.localdomain4",
    "::1\tlocalhost localhost.localdomain localhost6 localhost6.localdomain6",
];

fn read_optional(path: &Path) -> PodliteResult<String> {
    match std::fs::read_to_string(path) {
        Ok(c) => Ok(c),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(PodliteError::from(e).context(format!("reading {}", path.display()))),
    }
}

/// Content the hosts file starts from: the image's own file, nothing, or a
/// configured host file.
fn base_content(base_hosts_file: &str, mountpoint: &Path) -> PodliteResult<String> {
    match base_hosts_file {
        "" => read_optional(&secure_join(mountpoint, "/etc/hosts")?),
        BASE_HOSTS_NONE => Ok(String::new()),
        path => read_optional(Path::new(path)),
    }
}

/// `name:ip` to a hosts line.
fn extra_host_line(entry: &str) -> PodliteResult<String> {
    let (name, ip) = entry.split_once(':').ok_or_else(|| {
        PodliteError::InvalidArgument(format!("invalid extra host entry {:?}, expected name:ip", entry))
    })?;
    if name.is_empty() || ip.is_empty() {
        return Err(PodliteError::InvalidArgument(format!(
            "invalid extra host entry {:?}, expected name:ip",
            entry
        )));
    }
    Ok(format!("{}\t{}", ip, name))
}

/// Names the container answers to.
pub(crate) fn container_names(config: &ContainerConfig) -> String {
    let hostname = config.hostname();
    if hostname == config.name {
        hostname
    } else {
        format!("{} {}", hostname, config.name)
    }
}

/// Entry added for a container joining another container's network.
pub(crate) fn localhost_entry(config: &ContainerConfig) -> String {
    format!("127.0.0.1\t{}", container_names(config))
}

/// Build the hosts file for a container that owns its network.
pub(crate) fn generate(
    config: &ContainerConfig,
    base_hosts_file: &str,
    mountpoint: &Path,
    network: &BTreeMap<String, NetworkStatus>,
) -> PodliteResult<String> {
    let mut lines: Vec<String> = Vec::new();
    for entry in &config.host_add {
        lines.push(extra_host_line(entry)?);
    }

    let base = base_content(base_hosts_file, mountpoint)?;
    let has_localhost = base
        .lines()
        .any(|l| l.split_whitespace().skip(1).any(|n| n == "localhost"));
    lines.extend(base.lines().map(str::to_string));
    if !has_localhost {
        lines.extend(DEFAULT_LOCALHOST.iter().map(|l| l.to_string()));
    }

    let names = container_names(config);
    let addresses: Vec<_> = network.values().flat_map(|s| s.addresses()).collect();
    if addresses.is_empty() {
        lines.push(format!("127.0.0.1\t{}", names));
        lines.push(format!("::1\t{}", names));
    } else {
        lines.extend(addresses.iter().map(|ip| format!("{}\t{}", ip, names)));
    }

    let gateway = network
        .values()
        .flat_map(|s| s.interfaces.values())
        .flat_map(|iface| iface.subnets.iter())
        .find_map(|subnet| subnet.gateway);
    if let Some(gw) = gateway {
        lines.push(format!("{}\t{}", gw, HOST_GATEWAY_NAMES));
    }

    let mut out = String::new();
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// Append `entry` to a hosts file shared by several containers.
///
/// The file's own path lock is taken instead of the owning container's
/// lock, which may already be held by a container being cleaned up.
pub(crate) fn add_entry(path: &Path, entry: &str) -> PodliteResult<()> {
    let _lock = PathLock::acquire(path)?;
    let content = read_optional(path)?;
    if content.lines().any(|l| l == entry) {
        return Ok(());
    }
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| PodliteError::from(e).context(format!("opening {}", path.display())))?;
    let prefix = if content.is_empty() || content.ends_with('\n') { "" } else { "\n" };
    write!(file, "{}{}\n", prefix, entry)
        .map_err(|e| PodliteError::Storage(format!("writing {}: {}", path.display(), e)))?;
    Ok(())
}
