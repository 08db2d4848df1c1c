//! Container path to host path resolution.
//!
//! A path inside a container may live on the root filesystem, on a named
//! volume, or on a bind mount. The deepest mount containing the path wins,
//! the same way the kernel stacks mounts.

use std::path::{Path, PathBuf};

use podlite_shared::errors::{PodliteError, PodliteResult};

use crate::container::config::ContainerConfig;
use crate::fs::secure_join;
use crate::util::clean_path;

/// Absolute, cleaned form of `container_path`. Relative paths are taken
/// relative to the container's working directory.
pub fn absolute_container_path(config: &ContainerConfig, container_path: &str) -> String {
    if container_path.starts_with('/') {
        clean_path(container_path)
    } else {
        clean_path(&format!("/{}/{}", config.work_dir(), container_path))
    }
}

/// Resolve `container_path` to `(root, host_path)`.
///
/// `root` is the host directory the path was resolved under: the volume's
/// mount point, the bind mount's source, or `mountpoint`. `host_path` is
/// always inside `root`.
///
/// `volume_mount_point` returns where a named volume is mounted on the
/// host, `None` if it is not mounted.
pub fn resolve_path(
    config: &ContainerConfig,
    mountpoint: &Path,
    container_path: &str,
    volume_mount_point: &dyn Fn(&str) -> PodliteResult<Option<PathBuf>>,
) -> PodliteResult<(PathBuf, PathBuf)> {
    let path = absolute_container_path(config, container_path);

    let mut search = path.clone();
    loop {
        if let Some(volume) = config
            .named_volumes
            .iter()
            .find(|v| clean_path(&v.dest) == search)
        {
            let root = volume_mount_point(&volume.name)?.ok_or_else(|| {
                PodliteError::VolumeNotMounted(format!(
                    "volume {} is not mounted, cannot copy into it",
                    volume.name
                ))
            })?;
            let host = secure_join(&root, remainder(&path, &search))?;
            return Ok((root, host));
        }

        if let Some(source) = bind_source(config, &search) {
            let host = secure_join(&source, remainder(&path, &search))?;
            return Ok((source, host));
        }

        if search == "/" {
            break;
        }
        search = parent(&search);
    }

    let host = secure_join(mountpoint, &path)?;
    Ok((mountpoint.to_path_buf(), host))
}

/// Source of the declared bind mount whose destination is exactly `dest`.
fn bind_source(config: &ContainerConfig, dest: &str) -> Option<PathBuf> {
    config.spec.mounts().as_ref()?.iter().find_map(|m| {
        let is_bind = m.typ().as_deref() == Some("bind");
        let matches = clean_path(&m.destination().to_string_lossy()) == dest;
        if is_bind && matches {
            m.source().clone()
        } else {
            None
        }
    })
}

/// Part of `path` below `prefix`.
fn remainder<'a>(path: &'a str, prefix: &str) -> &'a str {
    path.strip_prefix(prefix).unwrap_or(path)
}

fn parent(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Whether `path` is a named volume destination or lies below one.
pub fn is_path_on_volume(config: &ContainerConfig, path: &str) -> bool {
    let path = clean_path(path);
    config
        .named_volumes
        .iter()
        .any(|v| is_sub_path(&path, &clean_path(&v.dest)))
}

/// Whether `path` is a declared mount destination or lies below one.
pub fn is_path_on_mount(config: &ContainerConfig, path: &str) -> bool {
    let path = clean_path(path);
    config.spec.mounts().as_ref().is_some_and(|mounts| {
        mounts.iter().any(|m| {
            let dest = clean_path(&m.destination().to_string_lossy());
            dest != "/" && is_sub_path(&path, &dest)
        })
    })
}

fn is_sub_path(path: &str, dest: &str) -> bool {
    path == dest || path.starts_with(&format!("{}/", dest.trim_end_matches('/')))
}
