//! Error types for svchost-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from configuration lookup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure while reading the file (permission denied, etc.).
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML parse error on load: includes file path and line context from `toml`.
    #[error("failed to parse configuration at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The configuration file did not exist at the expected path.
    #[error("configuration not found at {path}")]
    NotFound { path: PathBuf },

    /// A numeric key held something other than a plain decimal number.
    #[error("invalid number for `{key}`: {value:?}")]
    InvalidNumber { key: String, value: String },

    /// A key held a value outside its accepted set.
    #[error("invalid value for `{key}`: {value:?} (expected {expected})")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },

    /// An option value opened a quote it never closed.
    #[error("unterminated {quote} quote in `{key}`")]
    UnterminatedQuote { key: String, quote: char },
}
