//! Web hook command handlers

use anyhow::{Result, bail};
use clap::{Subcommand, ValueEnum};
use colored::*;
use kudu_core::domain::deployment::{DeploymentState, DeploymentStatus};
use kudu_core::domain::hook::{HookEventType, PublishStatus, WebHook};

use crate::config::Config;

/// Outcome reported by `hook publish`
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DeploymentOutcome {
    Success,
    Failed,
}

impl From<DeploymentOutcome> for DeploymentState {
    fn from(outcome: DeploymentOutcome) -> Self {
        match outcome {
            DeploymentOutcome::Success => DeploymentState::Success,
            DeploymentOutcome::Failed => DeploymentState::Failed,
        }
    }
}

/// Web hook subcommands
#[derive(Subcommand)]
pub enum HookCommands {
    /// List registered web hooks
    List,
    /// Show one web hook
    Get {
        /// Hook ID
        id: String,
    },
    /// Register a post-deployment web hook
    Add {
        /// http(s) address to notify
        address: String,

        /// Skip certificate validation when notifying
        #[arg(long)]
        insecure_ssl: bool,
    },
    /// Unregister a web hook
    Remove {
        /// Hook ID
        id: String,
    },
    /// Notify every hook of a finished deployment
    Publish {
        /// Deployment ID, generated when omitted
        #[arg(long)]
        deployment_id: Option<String>,

        #[arg(long, value_enum, default_value = "success")]
        status: DeploymentOutcome,

        /// Deployment message
        #[arg(long)]
        message: Option<String>,
    },
}

/// Handle web hook commands
pub async fn handle_hook_command(command: HookCommands, config: &Config) -> Result<()> {
    let site = config.open_site()?;
    let hooks = site.hooks();

    match command {
        HookCommands::List => {
            let registered = hooks.web_hooks().await?;
            if registered.is_empty() {
                println!("{}", "No web hooks registered.".yellow());
            } else {
                println!(
                    "{}",
                    format!("Found {} web hook(s):", registered.len()).bold()
                );
                println!();
                for hook in &registered {
                    print_hook(hook);
                }
            }
            Ok(())
        }
        HookCommands::Get { id } => {
            let Some(hook) = hooks.get_web_hook(&id).await? else {
                bail!("Web hook '{}' not found", id);
            };
            print_hook(&hook);
            Ok(())
        }
        HookCommands::Add {
            address,
            insecure_ssl,
        } => {
            let hook = WebHook::new(HookEventType::PostDeployment, address)
                .with_insecure_ssl(insecure_ssl);
            let hook = hooks.add_web_hook(hook).await?;
            println!(
                "{} Registered web hook {} for {}",
                "✓".green(),
                hook.id.bold(),
                hook.hook_address
            );
            Ok(())
        }
        HookCommands::Remove { id } => {
            hooks.remove_web_hook(&id).await?;
            println!("{} Removed web hook {}", "✓".green(), id.bold());
            Ok(())
        }
        HookCommands::Publish {
            deployment_id,
            status,
            message,
        } => {
            let id = deployment_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
            let mut deployment = DeploymentStatus::new(id, status.into());
            deployment.message = message;

            let delivered = hooks.publish_post_deployment(&deployment).await;
            let total = hooks.web_hooks().await?.len();
            println!(
                "{} Deployment {} delivered to {} web hook(s), {} registered",
                "▸".cyan(),
                deployment.id.dimmed(),
                delivered,
                total
            );
            Ok(())
        }
    }
}

fn print_hook(hook: &WebHook) {
    println!("  {} Hook {}", "▸".cyan(), hook.id.bold());
    println!("    Event:        {}", hook.hook_event_type);
    println!("    Address:      {}", hook.hook_address);
    if hook.insecure_ssl {
        println!("    Insecure SSL: {}", "yes".yellow());
    }
    if let Some(date) = hook.last_publish_date {
        let status = match hook.last_publish_status {
            Some(PublishStatus::Success) => "Success".green(),
            Some(PublishStatus::Failure) => "Failure".red(),
            None => "Unknown".dimmed(),
        };
        println!(
            "    Last publish: {} {}",
            status,
            date.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
        if let Some(reason) = &hook.last_publish_reason {
            println!("    Reason:       {}", reason.dimmed());
        }
    }
    println!();
}
