//! Durable diagnostics for the service: a `tracing` subscriber that writes to
//! the service log file, and the sink captured records are pushed into.
//!
//! The subscriber never writes to stdout or stderr; both are redirected into
//! the capture channel while the service runs, so logging there would feed the
//! log back into itself.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use svchost_core::{DiagnosticsSink, Level};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

use crate::error::ServiceError;
use crate::log_rotation::{self, MAX_LOG_BYTES, MAX_ROTATED_FILES};

/// Target captured stdout/stderr records are logged under.
pub const CAPTURE_TARGET: &str = "stdlog";

/// Line prefix options, fixed for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFormat {
    pub thread_ids: bool,
    pub milliseconds: bool,
}

impl Default for LogFormat {
    fn default() -> Self {
        Self {
            thread_ids: false,
            milliseconds: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub file: PathBuf,
    /// `EnvFilter` directives; `RUST_LOG` takes precedence when set.
    pub filter: String,
    pub max_bytes: u64,
    pub max_files: usize,
    pub format: LogFormat,
}

impl LogSettings {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            filter: "info".to_string(),
            max_bytes: MAX_LOG_BYTES,
            max_files: MAX_ROTATED_FILES,
            format: LogFormat::default(),
        }
    }
}

/// What [`start`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStarted {
    pub file: PathBuf,
    pub rotated: bool,
    /// False when another global subscriber was already in place.
    pub installed: bool,
}

/// Rotate and open the log file, then install the global subscriber.
///
/// Failing to create or open the file is fatal. Finding a subscriber already
/// installed is not; events keep flowing to it.
pub fn start(settings: &LogSettings) -> Result<LogStarted, ServiceError> {
    let logging_err = |path: &Path, source| ServiceError::Logging {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = settings.file.parent() {
        fs::create_dir_all(parent).map_err(|e| logging_err(parent, e))?;
    }
    let rotated =
        log_rotation::rotate_if_needed(&settings.file, settings.max_bytes, settings.max_files)
            .map_err(|e| logging_err(&settings.file, e))?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&settings.file)
        .map_err(|e| logging_err(&settings.file, e))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_thread_ids(settings.format.thread_ids)
        .with_thread_names(settings.format.thread_ids)
        .with_timer(LogTimer {
            milliseconds: settings.format.milliseconds,
        })
        .try_init()
        .is_ok();

    if rotated {
        tracing::info!(path = %settings.file.display(), "log file rotated");
    }
    if !installed {
        tracing::debug!("global subscriber already installed; keeping it");
    }

    Ok(LogStarted {
        file: settings.file.clone(),
        rotated,
        installed,
    })
}

/// Local wall-clock timestamps, with or without milliseconds.
#[derive(Debug, Clone, Copy)]
struct LogTimer {
    milliseconds: bool,
}

impl FormatTime for LogTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        let now = chrono::Local::now();
        if self.milliseconds {
            write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S%.3f"))
        } else {
            write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
        }
    }
}

/// Forwards captured records to `tracing` on the [`CAPTURE_TARGET`] target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn push(&self, level: Level, text: &[u8]) {
        let line = String::from_utf8_lossy(text);
        match level {
            Level::None => {}
            Level::Error => tracing::error!(target: CAPTURE_TARGET, "{line}"),
            Level::Warning => tracing::warn!(target: CAPTURE_TARGET, "{line}"),
            Level::Info => tracing::info!(target: CAPTURE_TARGET, "{line}"),
            Level::Debug => tracing::debug!(target: CAPTURE_TARGET, "{line}"),
        }
    }
}
