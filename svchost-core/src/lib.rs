//! svchost core library: configuration lookup, diagnostic levels, errors.
//!
//! Public API surface:
//! - [`config`]: hierarchical `section/name` lookup over a TOML file
//! - [`sink`]: [`Level`] and the [`DiagnosticsSink`] capability
//! - [`tokenize`]: quote-aware splitting of option values
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod sink;
pub mod tokenize;

pub use config::{Config, Section};
pub use error::ConfigError;
pub use sink::{DiagnosticsSink, Level};
