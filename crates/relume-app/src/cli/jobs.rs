//! Job inspection and operator command namespace.

use clap::{Args, Subcommand, ValueEnum};

use crate::cli::replay::ReplayArgs;

#[derive(Debug, Args)]
pub struct JobsArgs {
    #[command(subcommand)]
    pub command: JobsCommands,
}

#[derive(Debug, Subcommand)]
pub enum JobsCommands {
    /// Show queue, record, and dead-letter state for one job.
    Status(JobsStatusArgs),
    /// Show per-state queue counts and the oldest queued task.
    QueueStats(JobsQueueStatsArgs),
    /// Operate on the dead-letter archive.
    Replay(ReplayArgs),
}

#[derive(Debug, Args)]
pub struct JobsStatusArgs {
    /// Job id (UUID).
    pub id: String,
    /// Output format (json or table).
    #[arg(long, default_value = "table")]
    pub format: JobsStatusFormat,
}

#[derive(Debug, Args)]
pub struct JobsQueueStatsArgs {
    /// Output format (json or table).
    #[arg(long, default_value = "table")]
    pub format: JobsStatusFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum JobsStatusFormat {
    Json,
    Table,
}
