use std::path::PathBuf;

use thiserror::Error;

/// Error surface for starting and running a hosted service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] svchost_core::ConfigError),

    #[error("capture error: {0}")]
    Capture(#[from] svchost_capture::CaptureError),

    #[error("failed to start logging at {path}: {source}")]
    Logging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no program configured for service `{service}` (set service/program or pass --program)")]
    MissingProgram { service: String },

    #[error("failed to spawn {what}: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to route stop signals: {0}")]
    Signal(#[source] std::io::Error),

    #[error("failed to create event: {0}")]
    Event(#[source] std::io::Error),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ServiceError {
    ServiceError::Io {
        path: path.into(),
        source,
    }
}
