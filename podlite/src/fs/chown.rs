//! Ownership changes on host paths backing container mounts.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::unistd::{Gid, Uid, chown};
use podlite_shared::errors::{PodliteError, PodliteResult};
use walkdir::WalkDir;

use crate::util::clean_path;

/// Host directories that must never have their ownership rewritten.
const PROTECTED_PATHS: &[&str] = &[
    "/", "/bin", "/boot", "/dev", "/etc", "/home", "/lib", "/lib64", "/media", "/mnt", "/opt",
    "/proc", "/root", "/run", "/sbin", "/srv", "/sys", "/tmp", "/usr", "/var",
];

/// Whether `path` is a system directory that may not be chowned or relabeled.
pub fn is_protected(path: &Path) -> bool {
    let cleaned = clean_path(&path.to_string_lossy());
    PROTECTED_PATHS.contains(&cleaned.as_str())
}

/// Chown a single path, leaving it alone if it already has the right owner.
pub fn chown_path(path: &Path, uid: u32, gid: u32) -> PodliteResult<()> {
    let meta = std::fs::symlink_metadata(path)
        .map_err(|e| PodliteError::from(e).context(format!("stat {}", path.display())))?;
    if meta.file_type().is_symlink() || (meta.uid() == uid && meta.gid() == gid) {
        return Ok(());
    }
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(|e| {
        PodliteError::Storage(format!(
            "failed to chown {} to {}:{}: {}",
            path.display(),
            uid,
            gid,
            e
        ))
    })
}

/// Give `path` (and with `recursive`, everything below it) to `uid:gid`.
///
/// Symlinks are skipped rather than followed so a link inside a volume
/// cannot redirect the chown to an arbitrary host file.
pub fn change_host_path_ownership(
    path: &Path,
    recursive: bool,
    uid: u32,
    gid: u32,
) -> PodliteResult<()> {
    if is_protected(path) {
        return Err(PodliteError::InvalidArgument(format!(
            "chowning of system path {} is not allowed",
            path.display()
        )));
    }

    if !recursive {
        return chown_path(path, uid, gid);
    }

    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| {
            PodliteError::Storage(format!("failed to walk {}: {}", path.display(), e))
        })?;
        if entry.file_type().is_symlink() {
            continue;
        }
        chown_path(entry.path(), uid, gid)?;
    }

    tracing::debug!(path = %path.display(), uid, gid, "changed host path ownership");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_paths_are_protected() {
        assert!(is_protected(Path::new("/")));
        assert!(is_protected(Path::new("/usr/")));
        assert!(!is_protected(Path::new("/usr/local/data")));
        let err = change_host_path_ownership(Path::new("/etc"), true, 1, 1).unwrap_err();
        assert!(matches!(err, PodliteError::InvalidArgument(_)));
    }

    #[test]
    fn chown_to_current_owner_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), "x").unwrap();
        let meta = std::fs::metadata(dir.path()).unwrap();
        change_host_path_ownership(dir.path(), true, meta.uid(), meta.gid()).unwrap();
    }
}
