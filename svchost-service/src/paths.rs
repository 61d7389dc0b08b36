use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SERVICE_NAME: &str = "svchost";
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub const CONFIG_EXTENSION: &str = "toml";
pub const LOG_EXTENSION: &str = "log";

pub fn svchost_root(home: &Path) -> PathBuf {
    home.join(".svchost")
}

pub fn logs_dir(home: &Path) -> PathBuf {
    svchost_root(home).join("logs")
}

pub fn run_dir(home: &Path) -> PathBuf {
    svchost_root(home).join("run")
}

pub fn log_path(home: &Path, service: &str) -> PathBuf {
    logs_dir(home).join(format!("{service}.{LOG_EXTENSION}"))
}

/// Directory holding the running executable. Service processes do not control
/// their working directory, so relative paths resolve against this instead.
pub fn install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// `<install_dir>/<service>.toml`
pub fn default_config_path(install_dir: &Path, service: &str) -> PathBuf {
    install_dir.join(format!("{service}.{CONFIG_EXTENSION}"))
}

/// Anchor a relative `path` at `base`; absolute paths pass through.
pub fn resolve(base: &Path, path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
