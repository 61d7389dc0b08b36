//! `svchost args`: show the argument vector without starting anything.

use anyhow::{Context, Result};
use clap::Args;

use svchost_core::tokenize;

use super::ServiceArgs;

#[derive(Args, Debug)]
pub struct ArgsArgs {
    #[command(flatten)]
    pub service: ServiceArgs,

    /// Emit a JSON array instead of a shell-quoted line.
    #[arg(long)]
    pub json: bool,

    /// Arguments appended after the configured options.
    #[arg(last = true)]
    pub args: Vec<String>,
}

impl ArgsArgs {
    pub fn run(self) -> Result<()> {
        let mut options = self.service.options()?;
        options.args = self.args;
        let orchestrator = super::configure(options)?;
        let argv = &orchestrator.settings().argv;

        if self.json {
            println!(
                "{}",
                serde_json::to_string(argv).context("failed to render argv JSON")?
            );
        } else {
            let quoted: Vec<String> = argv.iter().map(|arg| tokenize::quote(arg)).collect();
            println!("{}", quoted.join(" "));
        }
        Ok(())
    }
}
