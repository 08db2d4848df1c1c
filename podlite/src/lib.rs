//! Podlite container engine library.
//!
//! This crate turns stored container configurations into OCI runtime
//! specifications and keeps container, pod and volume records in a
//! transactional store shared by every process using the same home directory.

use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

// Global guard for tracing-appender to keep the writer thread alive
static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

pub mod caps;
pub mod container;
pub mod db;
pub mod events;
pub mod fs;
pub mod lock;
pub mod pod;
pub mod runtime;
pub mod spec;
pub mod util;
pub mod volume;

pub use container::Container;
pub use container::config::ContainerConfig;
pub use container::state::{ContainerState, ContainerStatus};
pub use podlite_shared::errors::{PodliteError, PodliteResult};
pub use runtime::Runtime;
pub use runtime::options::RuntimeOptions;
pub use runtime::types::{ContainerID, PodID};

use runtime::layout::FilesystemLayout;

/// Initialize tracing for podlite using the provided filesystem layout.
///
/// Logs are written to `<layout.home_dir()>/logs/podlite.log` with daily rotation.
/// Uses the `RUST_LOG` environment variable for filtering (defaults to `info`).
/// Idempotent: subsequent calls return immediately once initialized.
pub fn init_logging_for(layout: &FilesystemLayout) -> PodliteResult<()> {
    let logs_dir = layout.logs_dir();
    std::fs::create_dir_all(&logs_dir).map_err(|e| {
        PodliteError::Storage(format!(
            "Failed to create logs directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let _ = LOG_GUARD.get_or_init(|| {
        let file_appender = tracing_appender::rolling::daily(logs_dir, "podlite.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info"))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        // A host application may already own the global subscriber.
        util::register_to_tracing(non_blocking, env_filter);

        guard
    });

    Ok(())
}
