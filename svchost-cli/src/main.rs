//! svchost: run a console daemon as a service with its output in the log.
//!
//! # Usage
//!
//! ```text
//! svchost run [--name <svc>] [--config <file>] [--program <path>] [--console] [--json] [-- <args>...]
//! svchost args [--name <svc>] [--config <file>] [--json] [-- <args>...]
//! svchost logs [--name <svc>] [--config <file>] [--lines <n>]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{args::ArgsArgs, logs::LogsArgs, run::RunArgs};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "svchost",
    version,
    about = "Host a console daemon as a service and capture its stdout/stderr",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the service in the foreground until the daemon exits or is stopped.
    Run(RunArgs),

    /// Print the argument vector the daemon would receive.
    Args(ArgsArgs),

    /// Print recent lines of the service log.
    Logs(LogsArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => args.run(),
        Commands::Args(args) => args.run(),
        Commands::Logs(args) => args.run(),
    }
}
