//! Stat and copy files in and out of a container.
//!
//! A running container is inspected from inside its mount namespace so the
//! caller sees exactly what the container sees. Otherwise the path is
//! resolved on the host against the mounted root filesystem, volumes and
//! bind mounts; a stopped container is mounted for the duration of the call.

use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use podlite_shared::errors::{PodliteError, PodliteResult};
use serde::{Deserialize, Serialize};

use super::Container;
use super::nsexec::run_in_container_namespace;
use super::resolve::{absolute_container_path, resolve_path};
use super::state::ContainerState;
use crate::fs::chown::chown_path;
use crate::fs::secure_join;

const GLOB_CHARS: &[char] = &['*', '?', '['];

/// What a container path refers to, as seen from inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    /// Permission and type bits as returned by stat(2).
    pub mode: u32,
    pub mod_time: DateTime<Utc>,
    pub is_dir: bool,
    /// The path the request resolved to, relative to the container root.
    pub link_target: String,
}

/// Where a request landed on the host.
struct Resolved {
    root: PathBuf,
    host: PathBuf,
}

impl Container {
    /// Stat `container_path`. Returns the info plus the root and host path
    /// it resolved to.
    pub fn stat(&self, container_path: &str) -> PodliteResult<(FileInfo, PathBuf, PathBuf)> {
        let requested = normalize_request(container_path)?;
        self.with_lock(|state| {
            self.with_mountpoint(state, |mountpoint, state| {
                let resolved = self.resolve_for_view(mountpoint, state, &requested)?;
                let config = self.config();
                run_in_container_namespace(config, state, || {
                    let resolved = resolved.finish(config, &requested)?;
                    let info = stat_resolved(config, mountpoint, &resolved, &requested)?;
                    Ok((info, resolved.root, resolved.host))
                })
            })
        })
        .map_err(|e| e.context(format!("container {}: stat {}", self.id(), container_path)))
    }

    /// Write a tar archive of `container_path` to `writer`.
    ///
    /// A path ending in `/.` archives the directory's contents; any other
    /// path archives the file or directory itself under its base name.
    pub fn copy_from_container(
        &self,
        container_path: &str,
        writer: &mut (dyn Write + Send),
    ) -> PodliteResult<()> {
        let requested = normalize_request(container_path)?;
        self.with_lock(|state| {
            self.with_mountpoint(state, |mountpoint, state| {
                let resolved = self.resolve_for_view(mountpoint, state, &requested)?;
                let config = self.config();
                run_in_container_namespace(config, state, move || {
                    let resolved = resolved.finish(config, &requested)?;
                    let info = stat_resolved(config, mountpoint, &resolved, &requested)?;
                    write_archive(&resolved.host, &info, &requested, writer)
                })
            })
        })
        .map_err(|e| e.context(format!("container {}: copy from {}", self.id(), container_path)))
    }

    /// Extract the tar archive read from `reader` into the directory
    /// `container_path`.
    pub fn copy_to_container(
        &self,
        container_path: &str,
        reader: &mut (dyn Read + Send),
    ) -> PodliteResult<()> {
        let requested = normalize_request(container_path)?;
        let chown_to = if self.config().id_mappings.uid_map.is_empty() {
            None
        } else {
            Some(self.host_ids(0, 0)?)
        };

        self.with_lock(|state| {
            self.with_mountpoint(state, |mountpoint, state| {
                let resolved = self.resolve_for_view(mountpoint, state, &requested)?;
                let config = self.config();
                if !state.status.is_running()
                    && config.read_only
                    && resolved.root.as_deref() == Some(mountpoint)
                {
                    return Err(PodliteError::InvalidArgument(format!(
                        "cannot copy into {}: container root filesystem is read-only",
                        requested
                    )));
                }
                run_in_container_namespace(config, state, move || {
                    let resolved = resolved.finish(config, &requested)?;
                    extract_archive(&resolved.host, reader, chown_to)
                })
            })
        })
        .map_err(|e| e.context(format!("container {}: copy to {}", self.id(), container_path)))
    }

    /// Run `f` with the container mounted, mounting it temporarily if needed.
    fn with_mountpoint<R>(
        &self,
        state: &ContainerState,
        f: impl FnOnce(&Path, &ContainerState) -> PodliteResult<R>,
    ) -> PodliteResult<R> {
        if state.mounted
            && let Some(mountpoint) = &state.mountpoint
        {
            return f(mountpoint, state);
        }

        let storage = &self.runtime.collaborators.storage;
        let mountpoint = storage.mount(self.config())?;
        let result = f(&mountpoint, state);
        if let Err(e) = storage.unmount(self.config(), false) {
            tracing::warn!(container_id = %self.id(), error = %e, "failed to unmount after copy");
        }
        result
    }

    /// Host-side resolution happens here; a running container resolves
    /// inside its own namespace instead.
    fn resolve_for_view(
        &self,
        mountpoint: &Path,
        state: &ContainerState,
        requested: &str,
    ) -> PodliteResult<PendingResolve> {
        if state.status.is_running() {
            return Ok(PendingResolve { root: None, host: None });
        }
        let (root, host) = resolve_path(self.config(), mountpoint, requested, &|name| {
            self.volume_mount_point(name)
        })?;
        Ok(PendingResolve { root: Some(root), host: Some(host) })
    }
}

/// Resolution that may still have to be completed in the container's view.
struct PendingResolve {
    root: Option<PathBuf>,
    host: Option<PathBuf>,
}

impl PendingResolve {
    fn finish(
        self,
        config: &crate::container::config::ContainerConfig,
        requested: &str,
    ) -> PodliteResult<Resolved> {
        match (self.root, self.host) {
            (Some(root), Some(host)) => Ok(Resolved { root, host }),
            _ => {
                let root = PathBuf::from("/");
                let host = secure_join(&root, &absolute_container_path(config, requested))?;
                Ok(Resolved { root, host })
            }
        }
    }
}

/// `/` means the contents of the root, and globs are not supported.
fn normalize_request(container_path: &str) -> PodliteResult<String> {
    if container_path.contains(GLOB_CHARS) {
        return Err(PodliteError::NotFound(format!(
            "{}: no such file or directory (wildcards are not supported)",
            container_path
        )));
    }
    if container_path == "/" {
        return Ok("/.".to_string());
    }
    Ok(container_path.to_string())
}

fn stat_resolved(
    config: &crate::container::config::ContainerConfig,
    mountpoint: &Path,
    resolved: &Resolved,
    requested: &str,
) -> PodliteResult<FileInfo> {
    let meta = std::fs::symlink_metadata(&resolved.host)
        .map_err(|e| PodliteError::from(e).context(format!("stat {}", requested)))?;

    let target = if meta.file_type().is_symlink() {
        // Dangling symlinks are not followed by secure_join; express the
        // link's target relative to the resolution root.
        let rel = resolved
            .host
            .strip_prefix(&resolved.root)
            .map_err(|e| PodliteError::Internal(e.to_string()))?;
        let link = std::fs::read_link(&resolved.host)?;
        let parent = rel.parent().unwrap_or(Path::new(""));
        let joined = if link.is_absolute() { link } else { Path::new("/").join(parent).join(link) };
        crate::util::clean_path(&joined.to_string_lossy())
    } else if let Ok(rel) = resolved.host.strip_prefix(mountpoint) {
        format!("/{}", rel.to_string_lossy())
    } else if resolved.root == Path::new("/") {
        resolved.host.to_string_lossy().into_owned()
    } else {
        // On a volume or bind mount: never hand out the host path.
        absolute_container_path(config, requested)
    };

    let link_target = preserve_base_path(requested, &crate::util::clean_path(&target));
    let modified = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());

    Ok(FileInfo {
        name: base_name(&link_target),
        size: meta.len(),
        mode: meta.permissions().mode(),
        mod_time: modified,
        is_dir: meta.is_dir(),
        link_target,
    })
}

/// Keep a trailing `/.` or `/` the caller asked for; path cleaning drops both.
fn preserve_base_path(original: &str, resolved: &str) -> String {
    if original.ends_with("/.") {
        if resolved == "/" {
            return "/.".to_string();
        }
        return format!("{}/.", resolved.trim_end_matches('/'));
    }
    if original.ends_with('/') && resolved != "/" {
        return format!("{}/", resolved.trim_end_matches('/'));
    }
    resolved.to_string()
}

fn base_name(path: &str) -> String {
    if path == "/" {
        return "/".to_string();
    }
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}

fn write_archive(
    host: &Path,
    info: &FileInfo,
    requested: &str,
    writer: &mut (dyn Write + Send),
) -> PodliteResult<()> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    let archive_err = |e: std::io::Error| PodliteError::Storage(format!("archiving {}: {}", requested, e));
    if info.is_dir {
        let name = if requested.ends_with("/.") { "." } else { info.name.as_str() };
        builder.append_dir_all(name, host).map_err(archive_err)?;
    } else {
        builder
            .append_path_with_name(host, &info.name)
            .map_err(archive_err)?;
    }
    builder.finish().map_err(archive_err)?;
    Ok(())
}

fn extract_archive(
    dest: &Path,
    reader: &mut (dyn Read + Send),
    chown_to: Option<(u32, u32)>,
) -> PodliteResult<()> {
    let meta = std::fs::metadata(dest)
        .map_err(|e| PodliteError::from(e).context(format!("stat {}", dest.display())))?;
    if !meta.is_dir() {
        return Err(PodliteError::InvalidArgument(format!(
            "{} is not a directory",
            dest.display()
        )));
    }

    let extract_err = |e: std::io::Error| {
        PodliteError::Storage(format!("extracting into {}: {}", dest.display(), e))
    };
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    for entry in archive.entries().map_err(extract_err)? {
        let mut entry = entry.map_err(extract_err)?;
        let rel = entry.path().map_err(extract_err)?.into_owned();
        if !entry.unpack_in(dest).map_err(extract_err)? {
            tracing::warn!(path = %rel.display(), "skipped archive entry outside the destination");
            continue;
        }
        if let Some((uid, gid)) = chown_to {
            chown_path(&dest.join(&rel), uid, gid)?;
        }
    }
    Ok(())
}
