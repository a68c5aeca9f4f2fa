//! Lock command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::*;

use crate::config::Config;

/// Lock subcommands
#[derive(Subcommand)]
pub enum LockCommands {
    /// Show which named locks are held and by whom
    Status,
}

/// Handle lock commands
pub async fn handle_lock_command(command: LockCommands, config: &Config) -> Result<()> {
    let site = config.open_site()?;

    match command {
        LockCommands::Status => {
            let locks = site.lock_status();
            println!(
                "{}",
                format!("Lock backend: {:?}", site.locks().backend()).bold()
            );
            if locks.is_empty() {
                println!("{}", "No locks found.".yellow());
                return Ok(());
            }
            println!();
            for lock in locks {
                let state = if lock.held { "held".red() } else { "free".green() };
                println!("  {} {} {}", "▸".cyan(), lock.name.bold(), state);
                if let Some(holder) = &lock.holder {
                    println!("    Operation: {}", holder.operation);
                    println!("    Holder:    {} (pid {})", holder.holder_id.dimmed(), holder.pid);
                    println!(
                        "    Since:     {}",
                        holder
                            .acquired_at
                            .format("%Y-%m-%d %H:%M:%S")
                            .to_string()
                            .dimmed()
                    );
                }
            }
            Ok(())
        }
    }
}
