//! Command-line interface definitions.

pub mod jobs;
pub mod replay;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

pub use jobs::{JobsArgs, JobsCommands, JobsStatusFormat};
pub use replay::{ReplayArgs, ReplayCommands};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "relume",
    version,
    author,
    about = "Relume image restoration control plane"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the Relume HTTP server, worker pool, and schedulers.
    Serve(ServeArgs),
    /// Inspect jobs and operate on the dead-letter archive.
    Jobs(JobsArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs;
