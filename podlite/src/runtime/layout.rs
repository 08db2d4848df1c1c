//! On-disk layout of a podlite home.
//!
//! ```text
//! home_dir/
//! ├── db/podlite.db     # state store
//! ├── locks/            # one file per allocated lock
//! ├── logs/             # rolling log files
//! └── events/events.log # append-only lifecycle events
//! static_dir/containers/<id>/userdata   # persistent per-container files
//! run_root/containers/<id>/userdata     # per-boot per-container files
//! ```

use std::path::{Path, PathBuf};

use crate::runtime::options::RuntimeOptions;
use crate::runtime::types::ContainerID;

#[derive(Debug, Clone)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
    static_dir: PathBuf,
    run_root: PathBuf,
    tmp_dir: PathBuf,
    volume_path: PathBuf,
}

impl FilesystemLayout {
    pub fn new(options: &RuntimeOptions) -> Self {
        Self {
            home_dir: options.home_dir.clone(),
            static_dir: options.static_dir.clone(),
            run_root: options.run_root.clone(),
            tmp_dir: options.tmp_dir.clone(),
            volume_path: options.volume_path.clone(),
        }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn db_dir(&self) -> PathBuf {
        self.home_dir.join("db")
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir().join("podlite.db")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.home_dir.join("locks")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join("logs")
    }

    pub fn events_file(&self) -> PathBuf {
        self.home_dir.join("events").join("events.log")
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn container_static_dir(&self, id: &ContainerID) -> PathBuf {
        self.static_dir.join("containers").join(id.as_str()).join("userdata")
    }

    pub fn container_run_dir(&self, id: &ContainerID) -> PathBuf {
        self.run_root.join("containers").join(id.as_str()).join("userdata")
    }

    /// Directory holding the data of a local volume.
    pub fn volume_dir(&self, name: &str) -> PathBuf {
        self.volume_path.join(name)
    }

    /// Create every directory the runtime needs.
    pub fn prepare(&self) -> std::io::Result<()> {
        for dir in [
            self.home_dir.clone(),
            self.db_dir(),
            self.locks_dir(),
            self.logs_dir(),
            self.home_dir.join("events"),
            self.static_dir.clone(),
            self.run_root.clone(),
            self.tmp_dir.clone(),
            self.volume_path.clone(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
