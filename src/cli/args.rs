use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "backupkit", version, about = "Unattended backup orchestration")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub dry_run: bool,
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
    /// Suppress status lines on the terminal; alerts are still printed.
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Check the lock, rotate artifacts and run every configured phase.
    Run,
    /// Stop emailing lockfile alerts until the lock is cleared.
    Silence,
    Unsilence,
    /// Block future runs until `enable`.
    Disable,
    Enable,
    /// Remove a stale lockfile left behind by a crashed run.
    ClearLock,
    /// Show the lock and semaphore state.
    Status,
    /// Only rotate and prune the configured artifact families.
    Rotate,
}
