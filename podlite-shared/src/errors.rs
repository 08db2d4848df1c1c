//! Error types used across the podlite engine.

use thiserror::Error;

/// Result type for podlite operations.
pub type PodliteResult<T> = Result<T, PodliteError>;

#[derive(Debug, Error)]
pub enum PodliteError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("ID already in use: {0}")]
    IdExists(String),

    #[error("name already in use: {0}")]
    NameExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("volume is not mounted: {0}")]
    VolumeNotMounted(String),

    #[error("database configuration mismatch: {0}")]
    DbBadConfig(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("namespace error: {0}")]
    Namespace(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{}", join_errors(.0))]
    Multiple(Vec<PodliteError>),
}

fn join_errors(errors: &[PodliteError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl PodliteError {
    /// Prefix the message with `ctx` while keeping the error kind.
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        use PodliteError::*;
        let wrap = |msg: String| format!("{}: {}", ctx, msg);
        match self {
            NotFound(m) => NotFound(wrap(m)),
            IdExists(m) => IdExists(wrap(m)),
            NameExists(m) => NameExists(wrap(m)),
            InvalidArgument(m) => InvalidArgument(wrap(m)),
            Busy(m) => Busy(wrap(m)),
            VolumeNotMounted(m) => VolumeNotMounted(wrap(m)),
            DbBadConfig(m) => DbBadConfig(wrap(m)),
            InvalidState(m) => InvalidState(wrap(m)),
            Database(m) => Database(wrap(m)),
            Config(m) => Config(wrap(m)),
            Storage(m) => Storage(wrap(m)),
            Network(m) => Network(wrap(m)),
            Namespace(m) => Namespace(wrap(m)),
            Unsupported(m) => Unsupported(wrap(m)),
            Internal(m) => Internal(wrap(m)),
            Multiple(errs) => {
                let ctx = ctx.to_string();
                Multiple(errs.into_iter().map(|e| e.context(&ctx)).collect())
            }
        }
    }

    /// True for the not-found class, including composites made only of not-found errors.
    pub fn is_not_found(&self) -> bool {
        match self {
            PodliteError::NotFound(_) => true,
            PodliteError::Multiple(errs) => !errs.is_empty() && errs.iter().all(|e| e.is_not_found()),
            _ => false,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, PodliteError::Busy(_))
    }

    /// Collapse a list of errors: `None` when empty, the error itself when
    /// there is exactly one, a composite otherwise.
    pub fn join(mut errors: Vec<PodliteError>) -> Option<PodliteError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(PodliteError::Multiple(errors)),
        }
    }
}

/// Heuristic used where the underlying primitive does not return a typed
/// not-exist error.
pub fn looks_like_not_found(msg: &str) -> bool {
    msg.to_ascii_lowercase().contains("no such file or directory")
}

impl From<std::io::Error> for PodliteError {
    fn from(err: std::io::Error) -> Self {
        let msg = err.to_string();
        if err.kind() == std::io::ErrorKind::NotFound || looks_like_not_found(&msg) {
            PodliteError::NotFound(msg)
        } else {
            PodliteError::Internal(format!("I/O error: {}", msg))
        }
    }
}

impl From<serde_json::Error> for PodliteError {
    fn from(err: serde_json::Error) -> Self {
        PodliteError::Internal(format!("JSON error: {}", err))
    }
}

impl From<rusqlite::Error> for PodliteError {
    fn from(err: rusqlite::Error) -> Self {
        PodliteError::Database(err.to_string())
    }
}

impl From<oci_spec::OciSpecError> for PodliteError {
    fn from(err: oci_spec::OciSpecError) -> Self {
        PodliteError::Internal(format!("runtime spec error: {}", err))
    }
}

impl From<String> for PodliteError {
    fn from(err: String) -> Self {
        if looks_like_not_found(&err) {
            PodliteError::NotFound(err)
        } else {
            PodliteError::Internal(err)
        }
    }
}

impl From<&str> for PodliteError {
    fn from(err: &str) -> Self {
        PodliteError::from(err.to_string())
    }
}
