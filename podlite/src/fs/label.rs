//! SELinux file relabeling for `z` / `Z` mount options.

use std::path::Path;

use podlite_shared::errors::{PodliteError, PodliteResult};
use walkdir::WalkDir;

use super::chown::is_protected;

const SELINUX_XATTR: &str = "security.selinux";

/// Level given to content shared between containers.
const SHARED_LEVEL: &str = "s0";

/// The label to apply: shared content drops the MCS categories.
///
/// Labels have the form `user:role:type:level`; the level may itself contain
/// a colon (`s0:c1,c2`).
pub fn effective_label(mount_label: &str, shared: bool) -> String {
    if !shared {
        return mount_label.to_string();
    }
    let parts: Vec<&str> = mount_label.splitn(4, ':').collect();
    if parts.len() < 4 {
        return mount_label.to_string();
    }
    format!("{}:{}:{}:{}", parts[0], parts[1], parts[2], SHARED_LEVEL)
}

/// Recursively set the SELinux label of `path`.
pub fn relabel(path: &Path, mount_label: &str, shared: bool) -> PodliteResult<()> {
    if mount_label.is_empty() {
        return Ok(());
    }
    if is_protected(path) {
        return Err(PodliteError::InvalidArgument(format!(
            "relabeling of system path {} is not allowed",
            path.display()
        )));
    }

    let label = effective_label(mount_label, shared);
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| {
            PodliteError::Storage(format!("failed to walk {}: {}", path.display(), e))
        })?;
        if entry.file_type().is_symlink() {
            continue;
        }
        xattr::set(entry.path(), SELINUX_XATTR, label.as_bytes()).map_err(|e| {
            PodliteError::Storage(format!(
                "failed to relabel {} to {}: {}",
                entry.path().display(),
                label,
                e
            ))
        })?;
    }

    tracing::debug!(path = %path.display(), label = %label, "relabeled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_label_drops_categories() {
        let label = "system_u:object_r:container_file_t:s0:c1,c2";
        assert_eq!(effective_label(label, false), label);
        assert_eq!(
            effective_label(label, true),
            "system_u:object_r:container_file_t:s0"
        );
    }

    #[test]
    fn empty_label_is_a_no_op() {
        relabel(Path::new("/"), "", true).unwrap();
    }
}
