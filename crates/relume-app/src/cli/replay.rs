//! Dead-letter operator command namespace.

use clap::{ArgAction, Args, Subcommand};

#[derive(Debug, Args)]
pub struct ReplayArgs {
    #[command(subcommand)]
    pub command: ReplayCommands,
}

#[derive(Debug, Subcommand)]
pub enum ReplayCommands {
    /// List dead-letter entries.
    List,
    /// Show dead-letter statistics.
    Stats,
    /// Replay one dead-letter entry back onto the queue.
    Replay(ReplayOneArgs),
    /// Replay every dead-letter entry.
    ReplayAll(ReplayAllArgs),
    /// Replay all dead-letter entries belonging to one user.
    ReplayUser(ReplayUserArgs),
    /// Remove entries past their retention window.
    Cleanup(CleanupArgs),
}

#[derive(Debug, Args)]
pub struct ReplayOneArgs {
    /// Dead-letter id (`dl:<job id>`) or bare job id.
    pub id: String,
    /// Reason recorded on the replay audit.
    #[arg(long, default_value = "operator replay")]
    pub reason: String,
    /// Override the attempt budget for the replayed task.
    #[arg(long)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Args)]
pub struct ReplayAllArgs {
    /// Reason recorded on the replay audits.
    #[arg(long, default_value = "operator replay-all")]
    pub reason: String,
    /// Skip the confirmation prompt.
    #[arg(long, action = ArgAction::SetTrue)]
    pub yes: bool,
}

#[derive(Debug, Args)]
pub struct ReplayUserArgs {
    /// Owner id whose entries should be replayed.
    pub user_id: String,
    /// Reason recorded on the replay audits.
    #[arg(long, default_value = "operator replay-user")]
    pub reason: String,
}

#[derive(Debug, Args)]
pub struct CleanupArgs {
    /// Skip the confirmation prompt.
    #[arg(long, action = ArgAction::SetTrue)]
    pub yes: bool,
}
