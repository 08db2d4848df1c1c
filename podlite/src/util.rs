//! Small helpers shared across modules.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use podlite_shared::errors::{PodliteError, PodliteResult};
use tracing_appender::non_blocking::NonBlocking;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a fmt subscriber writing to `writer`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn register_to_tracing(writer: NonBlocking, filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        )
        .try_init()
        .is_ok()
}

/// Write `contents` to `dir/name` with the given mode, replacing any previous file.
pub fn write_file_mode(dir: &Path, name: &str, contents: &[u8], mode: u32) -> PodliteResult<PathBuf> {
    let path = dir.join(name);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(&path)
        .map_err(|e| {
            PodliteError::Storage(format!("failed to create {}: {}", path.display(), e))
        })?;
    file.write_all(contents)
        .map_err(|e| PodliteError::Storage(format!("failed to write {}: {}", path.display(), e)))?;
    Ok(path)
}

/// Remove a file, treating a missing file as success.
pub fn remove_file_if_exists(path: &Path) -> PodliteResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PodliteError::Storage(format!(
            "failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Lexically clean a path: collapse `.`, `..` and duplicate separators.
///
/// `..` never climbs above the root of an absolute path.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !rooted {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Number of components in a cleaned absolute path (`/` has zero).
pub fn path_depth(path: &str) -> usize {
    clean_path(path).split('/').filter(|p| !p.is_empty()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_normalizes() {
        assert_eq!(clean_path("/a/b/../c/./d/"), "/a/c/d");
        assert_eq!(clean_path("/../.."), "/");
        assert_eq!(clean_path("a/../../b"), "../b");
        assert_eq!(clean_path(""), ".");
        assert_eq!(clean_path("//etc//hosts"), "/etc/hosts");
    }

    #[test]
    fn depth_counts_components() {
        assert_eq!(path_depth("/"), 0);
        assert_eq!(path_depth("/data"), 1);
        assert_eq!(path_depth("/data/sub/"), 2);
    }

    #[test]
    fn remove_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_file_if_exists(&dir.path().join("absent")).unwrap();
    }

    #[test]
    fn write_file_sets_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = write_file_mode(dir.path(), "hostname", b"abc\n", 0o644).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(fs::read_to_string(&path).unwrap(), "abc\n");
        // umask can only clear bits
        assert_eq!(mode & !0o644, 0);
    }
}
