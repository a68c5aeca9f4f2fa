//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod hooks;
mod jobs;
mod locks;

pub use hooks::HookCommands;
pub use jobs::JobCommands;
pub use locks::LockCommands;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// WebJob management
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Web hook management
    Hook {
        #[command(subcommand)]
        command: HookCommands,
    },
    /// Named operation locks
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Job { command } => jobs::handle_job_command(command, config).await,
        Commands::Hook { command } => hooks::handle_hook_command(command, config).await,
        Commands::Lock { command } => locks::handle_lock_command(command, config).await,
    }
}
