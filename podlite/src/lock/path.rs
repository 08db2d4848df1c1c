use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use podlite_shared::errors::{PodliteError, PodliteResult};

use super::file::flock;

/// Exclusive flock on `<path>.lock`, released on drop.
///
/// Guards files written by several containers, such as the hosts file of a
/// shared network namespace. The owning container's lock cannot be used
/// there: the owner may be cleaning up while holding it.
pub struct PathLock {
    file: File,
    path: PathBuf,
}

impl PathLock {
    pub fn acquire(path: &Path) -> PodliteResult<Self> {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(".lock");
        let path = PathBuf::from(sidecar);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| PodliteError::Storage(format!("opening {}: {}", path.display(), e)))?;
        flock(&file, libc::LOCK_EX)
            .map_err(|e| PodliteError::Storage(format!("locking {}: {}", path.display(), e)))?;
        Ok(Self { file, path })
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        if let Err(e) = flock(&self.file, libc::LOCK_UN) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release path lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_waits_for_drop() {
        let dir = tempfile::tempdir().unwrap();
        let hosts = dir.path().join("hosts");

        let held = PathLock::acquire(&hosts).unwrap();
        let other = File::open(dir.path().join("hosts.lock")).unwrap();
        assert!(flock(&other, libc::LOCK_EX | libc::LOCK_NB).is_err());

        drop(held);
        assert!(flock(&other, libc::LOCK_EX | libc::LOCK_NB).is_ok());
    }
}
