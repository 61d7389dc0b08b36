//! Error types for svchost-capture.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise while setting up or running the capture channel.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// An I/O error, with annotated channel path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another live process is already serving the channel path.
    #[error("capture channel already in use: {path}")]
    InUse { path: PathBuf },

    /// The channel did not accept a client within the allotted time.
    #[error("capture channel {path} not reachable within {timeout_ms} ms")]
    Unreachable { path: PathBuf, timeout_ms: u128 },

    /// Accepting on the listener failed with something other than "no client yet".
    #[error("accept on capture channel failed: {0}")]
    Accept(#[source] std::io::Error),

    /// Reading from a connected endpoint failed unexpectedly.
    #[error("read on endpoint {endpoint} failed: {source}")]
    Read {
        endpoint: u64,
        #[source]
        source: std::io::Error,
    },

    /// Redirecting a standard stream into the channel failed.
    #[error("failed to redirect {stream} into the capture channel: {source}")]
    Redirect {
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The multi-wait call itself failed.
    #[error("wait failed: {0}")]
    Wait(#[source] std::io::Error),
}

/// Convenience constructor for [`CaptureError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CaptureError {
    CaptureError::Io {
        path: path.into(),
        source,
    }
}
