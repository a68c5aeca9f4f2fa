//! Kudu CLI
//!
//! Command-line interface for administering the WebJobs and web hooks of a
//! site root. It opens the site directly and goes through the same locks as
//! the agent, so both can run against one root at the same time.

mod commands;
mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;

#[derive(Parser)]
#[command(name = "kudu")]
#[command(about = "Kudu WebJobs site CLI", long_about = None)]
struct Cli {
    /// Site root
    #[arg(long, env = "KUDU_ROOT", default_value = "site")]
    root: PathBuf,

    /// Read-only jobs tree deployed alongside the site
    #[arg(long, env = "KUDU_SECONDARY_JOBS_PATH")]
    secondary_jobs_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config {
        root: cli.root,
        secondary_jobs_path: cli.secondary_jobs_path,
    };

    handle_command(cli.command, &config).await
}
