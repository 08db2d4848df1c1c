//! Host filesystem helpers shared by the pipeline.

pub mod chown;
pub mod label;
pub mod securejoin;

pub use securejoin::secure_join;

use std::path::Path;

use podlite_shared::errors::{PodliteError, PodliteResult};

/// Copy `src` to `dst`, keeping the source's permission bits.
pub fn copy_file(src: &Path, dst: &Path) -> PodliteResult<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            PodliteError::from(e).context(format!("creating {}", parent.display()))
        })?;
    }
    std::fs::copy(src, dst).map_err(|e| {
        PodliteError::from(e).context(format!(
            "copying {} to {}",
            src.display(),
            dst.display()
        ))
    })?;
    Ok(())
}

/// Recursively copy a file or directory tree. Symlinks are recreated, not followed.
pub fn copy_tree(src: &Path, dst: &Path) -> PodliteResult<()> {
    let meta = std::fs::symlink_metadata(src)?;
    if !meta.is_dir() {
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(src)?;
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::os::unix::fs::symlink(target, dst)?;
            return Ok(());
        }
        return copy_file(src, dst);
    }

    for entry in walkdir::WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| PodliteError::Storage(format!("walking {}: {}", src.display(), e)))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| PodliteError::Internal(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
