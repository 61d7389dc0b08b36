//! Turning "start with these options" plus the configuration file into the
//! immutable settings one service run uses.

use std::path::{Path, PathBuf};
use std::time::Duration;

use svchost_capture::multiplexer::{DEFAULT_BUFFER_SIZE, DEFAULT_DRAIN_TIMEOUT, DEFAULT_MAX_WAIT};
use svchost_capture::CaptureOptions;
use svchost_core::{Config, ConfigError, Level};

use crate::error::ServiceError;
use crate::logging::{LogFormat, LogSettings};
use crate::log_rotation::{MAX_LOG_BYTES, MAX_ROTATED_FILES};
use crate::paths;
use crate::worker;

/// What the service control surface hands over at start.
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// Service name; falls back to `service/name`, then the default name.
    pub name: Option<String>,
    /// Explicit configuration file. When given it must exist; otherwise
    /// `<install_dir>/<service>.toml` is read if present.
    pub config: Option<PathBuf>,
    /// Program to host; overrides `service/program`.
    pub program: Option<String>,
    /// Command-line arguments appended after the configured options.
    pub args: Vec<String>,
    /// Mirror captured records to the console even if not configured.
    pub console: bool,
    /// Base of the default log and runtime locations.
    pub home: PathBuf,
    /// Base for relative paths; defaults to the executable's directory.
    pub install_dir: Option<PathBuf>,
}

impl ServiceOptions {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            ..Self::default()
        }
    }

    pub fn install_dir(&self) -> PathBuf {
        self.install_dir.clone().unwrap_or_else(paths::install_dir)
    }
}

/// Everything one run needs, resolved once before any thread starts.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub name: String,
    pub program: Option<String>,
    pub argv: Vec<String>,
    pub runtime_dir: PathBuf,
    pub shutdown_timeout: Duration,
    pub connect_timeout: Duration,
    pub log: LogSettings,
    pub capture: CaptureOptions,
    pub console_mirror: bool,
}

/// Load the configuration for `options`.
///
/// A missing explicit file is fatal; a missing default file yields an empty
/// configuration.
pub fn load_config(options: &ServiceOptions) -> Result<Config, ServiceError> {
    let install_dir = options.install_dir();
    match &options.config {
        Some(path) => Ok(Config::load(&paths::resolve(&install_dir, path))?),
        None => {
            let name = options.name.as_deref().unwrap_or(paths::DEFAULT_SERVICE_NAME);
            let path = paths::default_config_path(&install_dir, name);
            match Config::load(&path) {
                Ok(config) => Ok(config),
                Err(ConfigError::NotFound { .. }) => Ok(Config::empty()),
                Err(err) => Err(err.into()),
            }
        }
    }
}

impl ServiceSettings {
    pub fn resolve(config: &Config, options: &ServiceOptions) -> Result<Self, ServiceError> {
        let install_dir = options.install_dir();
        let name = options
            .name
            .clone()
            .or_else(|| config.get("service/name").map(str::to_string))
            .unwrap_or_else(|| paths::DEFAULT_SERVICE_NAME.to_string());

        let program = options
            .program
            .clone()
            .or_else(|| config.get("service/program").map(str::to_string));

        let runtime_dir = config
            .get("service/runtime_dir")
            .map(|dir| paths::resolve(&install_dir, dir))
            .unwrap_or_else(|| paths::run_dir(&options.home));

        let shutdown_timeout = config
            .get_number("service/shutdown_timeout_secs")?
            .map(Duration::from_secs)
            .unwrap_or(paths::SHUTDOWN_TIMEOUT);

        let log = LogSettings {
            file: config
                .get("log/file")
                .map(|file| paths::resolve(&install_dir, file))
                .unwrap_or_else(|| paths::log_path(&options.home, &name)),
            filter: config.get("log/filter").unwrap_or("info").to_string(),
            max_bytes: config.get_number("log/max_bytes")?.unwrap_or(MAX_LOG_BYTES),
            max_files: config
                .get_number("log/max_files")?
                .map(|n| n as usize)
                .unwrap_or(MAX_ROTATED_FILES),
            format: LogFormat {
                thread_ids: config
                    .get_bool("log/thread_ids")?
                    .unwrap_or(LogFormat::default().thread_ids),
                milliseconds: config
                    .get_bool("log/milliseconds")?
                    .unwrap_or(LogFormat::default().milliseconds),
            },
        };

        let capture = CaptureOptions {
            buffer_size: positive(config, "capture/buffer_size")?.unwrap_or(DEFAULT_BUFFER_SIZE),
            max_wait: positive(config, "capture/max_wait")?.unwrap_or(DEFAULT_MAX_WAIT),
            drain_timeout: config
                .get_number("capture/drain_timeout_ms")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_DRAIN_TIMEOUT),
            level: level(config, "log/capture_level")?.unwrap_or(Level::Info),
        };

        let connect_timeout = config
            .get_number("capture/connect_timeout_ms")?
            .map(Duration::from_millis)
            .unwrap_or(paths::CONNECT_TIMEOUT);

        let console_mirror =
            options.console || config.get_bool("log/console_mirror")?.unwrap_or(false);

        let argv = worker::build_argv(&name, config, &options.args)?;

        Ok(Self {
            name,
            program,
            argv,
            runtime_dir,
            shutdown_timeout,
            connect_timeout,
            log,
            capture,
            console_mirror,
        })
    }

    pub fn log_file(&self) -> &Path {
        &self.log.file
    }
}

fn positive(config: &Config, key: &str) -> Result<Option<usize>, ConfigError> {
    match config.get_number(key)? {
        Some(0) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: "0".to_string(),
            expected: "a positive number",
        }),
        Some(n) => Ok(Some(n as usize)),
        None => Ok(None),
    }
}

fn level(config: &Config, key: &str) -> Result<Option<Level>, ConfigError> {
    let Some(value) = config.get(key) else {
        return Ok(None);
    };
    value
        .parse::<Level>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            expected: "none, error, warning, info or debug",
        })
}
