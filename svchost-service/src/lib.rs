//! Service host runtime: runs a console daemon on a worker thread with its
//! stdout/stderr captured into the service log, and shuts both down in order.

mod error;
pub mod console;
pub mod hosted;
pub mod log_rotation;
pub mod logging;
pub mod orchestrator;
pub mod paths;
pub mod settings;
pub mod signals;
pub mod worker;

pub use error::ServiceError;
pub use hosted::{CommandDaemon, HostedDaemon};
pub use logging::{LogFormat, LogSettings, TracingSink};
pub use orchestrator::{Orchestrator, RunReport, ServiceState, StopHandle, StopReason};
pub use settings::{ServiceOptions, ServiceSettings};
