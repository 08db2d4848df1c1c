//! Symlink-safe path joining.
//!
//! [`secure_join`] resolves a path under a root the way the kernel would if
//! the root were `/`: `..` never climbs above the root and absolute symlink
//! targets are re-rooted. Components that do not exist are joined lexically.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use podlite_shared::errors::{PodliteError, PodliteResult};

/// Symlinks followed before giving up, same as the kernel's limit.
const MAX_SYMLINKS: u32 = 255;

/// Join `unsafe_path` onto `root` without ever escaping `root`.
pub fn secure_join(root: &Path, unsafe_path: &str) -> PodliteResult<PathBuf> {
    let mut resolved = PathBuf::new();
    let mut remaining: VecDeque<String> = split(unsafe_path);
    let mut links = 0;

    while let Some(part) = remaining.pop_front() {
        match part.as_str() {
            "" | "." => continue,
            ".." => {
                resolved.pop();
                continue;
            }
            _ => {}
        }

        let candidate = resolved.join(&part);
        let full = root.join(&candidate);
        let meta = match std::fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                resolved = candidate;
                continue;
            }
            Err(e) => {
                return Err(PodliteError::from(e).context(format!("lstat {}", full.display())));
            }
        };

        if !meta.file_type().is_symlink() {
            resolved = candidate;
            continue;
        }

        links += 1;
        if links > MAX_SYMLINKS {
            return Err(PodliteError::InvalidArgument(format!(
                "too many symlinks resolving {} under {}",
                unsafe_path,
                root.display()
            )));
        }

        let target = std::fs::read_link(&full)
            .map_err(|e| PodliteError::from(e).context(format!("readlink {}", full.display())))?;
        let target = target.to_string_lossy();
        if target.starts_with('/') {
            resolved = PathBuf::new();
        }
        let mut expanded = split(&target);
        expanded.extend(remaining);
        remaining = expanded;
    }

    if resolved.as_os_str().is_empty() {
        return Ok(root.to_path_buf());
    }
    Ok(root.join(resolved))
}

fn split(path: &str) -> VecDeque<String> {
    path.split('/').map(str::to_string).collect()
}
