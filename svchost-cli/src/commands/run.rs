//! `svchost run`: host the configured program in the foreground.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use svchost_service::{CommandDaemon, RunReport, ServiceError};

use super::ServiceArgs;

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub service: ServiceArgs,

    /// Program to host (overrides service/program).
    #[arg(long)]
    pub program: Option<String>,

    /// Mirror captured output to this terminal.
    #[arg(long)]
    pub console: bool,

    /// Print the run report as JSON once the service stops.
    #[arg(long)]
    pub json: bool,

    /// Arguments appended after the configured options.
    #[arg(last = true)]
    pub args: Vec<String>,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let mut options = self.service.options()?;
        options.program = self.program;
        options.console = self.console;
        options.args = self.args;

        let orchestrator = super::configure(options)?.with_signal_routing(true);
        let settings = orchestrator.settings();
        let program = settings
            .program
            .clone()
            .ok_or_else(|| ServiceError::MissingProgram {
                service: settings.name.clone(),
            })?;

        let report = orchestrator
            .run(Arc::new(CommandDaemon::new(program)))
            .context("service run failed")?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to render run report JSON")?
            );
        } else {
            print_summary(&report);
        }
        Ok(())
    }
}

fn print_summary(report: &RunReport) {
    let code = report
        .exit_code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!(
        "{}: stopped ({:?}), daemon exit code {code}",
        report.service, report.stop_reason
    );
    if report.worker_timed_out {
        println!("warning: the daemon did not stop within the shutdown timeout");
    }
    if report.capture_timed_out {
        println!("warning: output capture did not drain within the shutdown timeout");
    }
}
