//! The worker thread: builds the daemon's argument vector and runs it.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use svchost_capture::{Event, SetOnDrop, StdStream};
use svchost_core::{Config, ConfigError};

use crate::error::ServiceError;
use crate::hosted::HostedDaemon;

/// Section whose entries every hosted daemon receives.
pub const GLOBAL_OPTIONS: &str = "options";

/// `[service]`, then the `options` and `options.<service>` entries as
/// name/value tokens in file order, then `overrides`, which therefore win.
pub fn build_argv(
    service: &str,
    config: &Config,
    overrides: &[String],
) -> Result<Vec<String>, ConfigError> {
    let mut argv = vec![service.to_string()];
    argv.extend(config.section_tokens(GLOBAL_OPTIONS)?);
    argv.extend(config.section_tokens(&format!("{GLOBAL_OPTIONS}.{service}"))?);
    argv.extend(overrides.iter().cloned());
    Ok(argv)
}

/// Run `daemon` to completion and flush whatever it left in the std streams.
/// A non-zero exit is reported but is not a service failure.
pub fn run(daemon: &dyn HostedDaemon, argv: &[String]) -> i32 {
    tracing::info!(argv = ?argv, "hosted daemon starting");
    let code = daemon.run(argv);
    StdStream::Stdout.flush();
    StdStream::Stderr.flush();

    if code == 0 {
        tracing::info!("hosted daemon exited");
    } else {
        tracing::warn!(code, "hosted daemon exited with a non-zero code");
    }
    code
}

/// Start [`run`] on a thread named `worker`. `stopped` is set exactly once
/// when the thread finishes, panics included.
pub fn spawn(
    daemon: Arc<dyn HostedDaemon>,
    argv: Vec<String>,
    stopped: Arc<Event>,
) -> Result<JoinHandle<i32>, ServiceError> {
    thread::Builder::new()
        .name("worker".to_string())
        .spawn(move || {
            let _stopped = SetOnDrop::new(stopped);
            run(daemon.as_ref(), &argv)
        })
        .map_err(|source| ServiceError::Spawn {
            what: "worker thread",
            source,
        })
}
