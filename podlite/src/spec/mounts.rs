//! Mount list helpers for the spec generator.

use std::path::{Path, PathBuf};

use oci_spec::runtime::{Mount, MountBuilder, Spec};
use podlite_shared::errors::{PodliteError, PodliteResult};

use crate::fs::secure_join;
use crate::util::{clean_path, path_depth};

const OVERLAY: &str = "overlay";
const BIND: &str = "bind";
const TMPFS: &str = "tmpfs";

/// Destination of a mount as a cleaned string.
pub(crate) fn destination(mount: &Mount) -> String {
    clean_path(&mount.destination().to_string_lossy())
}

pub(crate) fn mounts_contain(mounts: &[Mount], dest: &str) -> bool {
    let dest = clean_path(dest);
    mounts.iter().any(|m| destination(m) == dest)
}

/// Whether the spec declares a mount at `dest`.
pub(crate) fn mount_exists(spec: &Spec, dest: &str) -> bool {
    spec.mounts()
        .as_deref()
        .is_some_and(|mounts| mounts_contain(mounts, dest))
}

/// The declared mount at `dest`, if any.
pub(crate) fn find_mount<'a>(spec: &'a Spec, dest: &str) -> Option<&'a Mount> {
    let dest = clean_path(dest);
    spec.mounts()
        .as_deref()?
        .iter()
        .find(|m| destination(m) == dest)
}

pub(crate) fn is_tmpfs(mount: &Mount) -> bool {
    mount.typ().as_deref() == Some(TMPFS)
}

pub(crate) fn mount_options(mount: &Mount) -> Vec<String> {
    mount.options().clone().unwrap_or_default()
}

/// Special markers found in a mount's option list.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MountMarkers {
    /// `O`: copy-on-write overlay.
    pub overlay: bool,
    /// `U`: chown the source to the container user.
    pub chown: bool,
    /// `z` (shared) or `Z` (private) relabel.
    pub relabel: Option<bool>,
}

/// Split the engine's own markers out of `options`.
pub(crate) fn split_markers(options: &[String]) -> (Vec<String>, MountMarkers) {
    let mut markers = MountMarkers::default();
    let mut rest = Vec::with_capacity(options.len());
    for opt in options {
        match opt.as_str() {
            "O" => markers.overlay = true,
            "U" => markers.chown = true,
            "z" => markers.relabel = Some(true),
            "Z" => markers.relabel = Some(false),
            _ => rest.push(opt.clone()),
        }
    }
    (rest, markers)
}

pub(crate) fn bind_mount(source: &Path, dest: &str, mut options: Vec<String>) -> PodliteResult<Mount> {
    if !options.iter().any(|o| o == "bind" || o == "rbind") {
        options.insert(0, "rbind".to_string());
    }
    Ok(MountBuilder::default()
        .destination(dest)
        .typ(BIND)
        .source(source)
        .options(options)
        .build()?)
}

/// Create a fresh upper/work directory pair under `static_dir/overlay`.
pub(crate) fn create_overlay_content_dir(static_dir: &Path) -> PodliteResult<PathBuf> {
    let dir = static_dir.join("overlay").join(uuid::Uuid::new_v4().simple().to_string());
    for sub in ["upper", "work"] {
        std::fs::create_dir_all(dir.join(sub)).map_err(|e| {
            PodliteError::Storage(format!("creating overlay directory {}: {}", dir.display(), e))
        })?;
    }
    Ok(dir)
}

/// Overlay of `content_dir` on top of `lower`.
///
/// A `ro` overlay only stacks the lower directory.
pub(crate) fn overlay_mount(
    lower: &Path,
    dest: &str,
    content_dir: &Path,
    options: &[String],
) -> PodliteResult<Mount> {
    let read_only = options.iter().any(|o| o == "ro");
    let mut opts = vec![format!("lowerdir={}", lower.display())];
    if !read_only {
        opts.push(format!("upperdir={}", content_dir.join("upper").display()));
        opts.push(format!("workdir={}", content_dir.join("work").display()));
    }
    opts.extend(
        options
            .iter()
            .filter(|o| !matches!(o.as_str(), "bind" | "rbind" | "O" | "U"))
            .cloned(),
    );
    Ok(MountBuilder::default()
        .destination(dest)
        .typ(OVERLAY)
        .source(OVERLAY)
        .options(opts)
        .build()?)
}

/// Order mounts so that a parent directory is mounted before its children.
/// The sort is stable, so mounts at the same depth keep their order.
pub(crate) fn sort_mounts(mounts: &mut [Mount]) {
    mounts.sort_by_key(|m| path_depth(&m.destination().to_string_lossy()));
}

/// Rewrite tmpfs destinations that traverse symlinks in the rootfs into the
/// path the symlinks point at.
pub(crate) fn resolve_tmpfs_destinations(mounts: &mut [Mount], rootfs: &Path) -> PodliteResult<()> {
    for mount in mounts.iter_mut().filter(|m| is_tmpfs(m)) {
        let dest = destination(mount);
        let resolved = secure_join(rootfs, &dest)?;
        let inside = resolved
            .strip_prefix(rootfs)
            .map_err(|e| PodliteError::Internal(format!("resolving {}: {}", dest, e)))?;
        let inside = format!("/{}", inside.to_string_lossy());
        if inside != dest {
            tracing::debug!(from = %dest, to = %inside, "tmpfs destination resolved through symlink");
            mount.set_destination(PathBuf::from(inside));
        }
    }
    Ok(())
}

/// Root propagation implied by the mounts: `shared` if any mount is shared,
/// else `rslave` if any is a slave.
pub(crate) fn root_propagation(mounts: &[Mount]) -> Option<&'static str> {
    let mut propagation = None;
    for opt in mounts.iter().flat_map(mount_options) {
        match opt.as_str() {
            "shared" | "rshared" => return Some("shared"),
            "slave" | "rslave" => propagation = Some("rslave"),
            _ => {}
        }
    }
    propagation
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount(dest: &str, typ: &str) -> Mount {
        MountBuilder::default()
            .destination(dest)
            .typ(typ)
            .source("/src")
            .build()
            .unwrap()
    }

    #[test]
    fn sort_puts_parents_first() {
        let mut mounts = vec![
            mount("/data/sub/deeper", BIND),
            mount("/data", BIND),
            mount("/etc/hosts", BIND),
            mount("/data/sub", BIND),
            mount("/proc", "proc"),
        ];
        sort_mounts(&mut mounts);
        let order: Vec<String> = mounts.iter().map(destination).collect();
        for (i, later) in order.iter().enumerate() {
            for earlier in &order[i + 1..] {
                assert!(
                    !later.starts_with(&format!("{}/", earlier)),
                    "{} sorted before its parent {}",
                    later,
                    earlier
                );
            }
        }
        assert_eq!(order[0], "/data");
        assert_eq!(order[1], "/proc");
    }

    #[test]
    fn markers_are_stripped() {
        let opts: Vec<String> = ["rw", "z", "U", "O", "noexec"].iter().map(|s| s.to_string()).collect();
        let (rest, markers) = split_markers(&opts);
        assert_eq!(rest, vec!["rw".to_string(), "noexec".to_string()]);
        assert_eq!(
            markers,
            MountMarkers { overlay: true, chown: true, relabel: Some(true) }
        );
    }

    #[test]
    fn shared_dominates_slave() {
        let mut slave = mount("/a", BIND);
        slave.set_options(Some(vec!["rslave".into()]));
        let mut shared = mount("/b", BIND);
        shared.set_options(Some(vec!["shared".into()]));
        assert_eq!(root_propagation(&[slave.clone()]), Some("rslave"));
        assert_eq!(root_propagation(&[slave, shared]), Some("shared"));
        assert_eq!(root_propagation(&[mount("/c", BIND)]), None);
    }

    #[test]
    fn overlay_options() {
        let dir = tempfile::tempdir().unwrap();
        let content = create_overlay_content_dir(dir.path()).unwrap();
        assert!(content.join("upper").is_dir());
        let m = overlay_mount(Path::new("/vol"), "/data", &content, &["nodev".into()]).unwrap();
        let opts = mount_options(&m);
        assert_eq!(opts[0], "lowerdir=/vol");
        assert!(opts[1].starts_with("upperdir="));
        assert_eq!(opts.last().unwrap(), "nodev");
        assert_eq!(m.typ().as_deref(), Some("overlay"));
    }

    #[test]
    fn tmpfs_symlink_destination_is_resolved() {
        let rootfs = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(rootfs.path().join("var/run-real")).unwrap();
        std::os::unix::fs::symlink("/var/run-real", rootfs.path().join("var/run")).unwrap();
        let mut mounts = vec![mount("/var/run", TMPFS), mount("/var/run", BIND)];
        resolve_tmpfs_destinations(&mut mounts, rootfs.path()).unwrap();
        assert_eq!(destination(&mounts[0]), "/var/run-real");
        assert_eq!(destination(&mounts[1]), "/var/run");
    }

    #[test]
    fn declared_mount_lookup() {
        let mut spec = Spec::default();
        spec.set_mounts(Some(vec![mount("/etc/passwd/", BIND)]));
        assert!(mount_exists(&spec, "/etc/passwd"));
        assert!(find_mount(&spec, "/etc").is_none());
    }
}
