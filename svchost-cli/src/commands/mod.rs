pub mod args;
pub mod logs;
pub mod run;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use svchost_service::{Orchestrator, ServiceOptions};

/// Flags naming the service and its configuration, shared by every command.
#[derive(Args, Debug, Clone)]
pub struct ServiceArgs {
    /// Service name (defaults to service/name, then "svchost").
    #[arg(long)]
    pub name: Option<String>,

    /// Configuration file. Relative paths resolve against the directory
    /// holding the svchost executable.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ServiceArgs {
    pub fn options(&self) -> Result<ServiceOptions> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        Ok(ServiceOptions {
            name: self.name.clone(),
            config: self.config.clone(),
            ..ServiceOptions::new(home)
        })
    }
}

/// Load and resolve the configuration; nothing is started yet.
pub fn configure(options: ServiceOptions) -> Result<Orchestrator> {
    Orchestrator::configure(options).context("failed to load service configuration")
}
