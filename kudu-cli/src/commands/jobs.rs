//! Job command handlers
//!
//! Handles all WebJob CLI commands: listing, details, settings, uploads,
//! triggered runs and their history, and enabling continuous jobs.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use colored::*;
use kudu_agent::Site;
use kudu_agent::fs::FileSystem;
use kudu_core::domain::job::{ContinuousStatus, DISABLE_FILE_NAME, Job, JobDetail, JobKind};
use kudu_core::domain::run::{RunStatus, TriggeredJobRun};
use serde_json::Value;

use crate::config::Config;

/// Job subcommands
#[derive(Subcommand)]
pub enum JobCommands {
    /// List jobs
    List {
        /// Only jobs of this kind (continuous or triggered)
        #[arg(long)]
        kind: Option<JobKind>,
    },
    /// Show job details
    Show {
        /// Job name
        name: String,
    },
    /// Show or change job settings
    Settings {
        /// Job name
        name: String,

        /// Set a setting; the value is parsed as JSON, else kept as a string
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,

        /// Remove a setting
        #[arg(long = "unset", value_name = "KEY")]
        unset: Vec<String>,
    },
    /// Create or replace a job from a script or a zip archive
    Deploy {
        /// Job name
        name: String,

        /// Script file or `.zip` archive
        path: PathBuf,

        #[arg(long, default_value = "triggered")]
        kind: JobKind,
    },
    /// Delete a job
    Delete {
        /// Job name
        name: String,
    },
    /// Run a triggered job and wait for it; Ctrl-C stops the run
    Invoke {
        /// Job name
        name: String,

        /// Passed to the job as WEBJOBS_COMMAND_ARGUMENTS
        #[arg(long)]
        args: Option<String>,
    },
    /// Show the run history of a triggered job
    History {
        /// Job name
        name: String,
    },
    /// Disable a continuous job
    Disable {
        /// Job name
        name: String,
    },
    /// Enable a continuous job; a running agent starts it
    Enable {
        /// Job name
        name: String,
    },
}

/// Handle job commands
pub async fn handle_job_command(command: JobCommands, config: &Config) -> Result<()> {
    let site = config.open_site()?;

    match command {
        JobCommands::List { kind } => list_jobs(&site, kind),
        JobCommands::Show { name } => show_job(&site, &name),
        JobCommands::Settings { name, set, unset } => job_settings(&site, &name, set, unset),
        JobCommands::Deploy { name, path, kind } => deploy_job(&site, &name, &path, kind),
        JobCommands::Delete { name } => delete_job(&site, &name).await,
        JobCommands::Invoke { name, args } => invoke_job(&site, &name, args).await,
        JobCommands::History { name } => job_history(&site, &name),
        JobCommands::Disable { name } => disable_job(&site, &name).await,
        JobCommands::Enable { name } => enable_job(&site, &name),
    }
}

fn jobs_of(site: &Site, kind: JobKind) -> Result<Vec<Job>> {
    Ok(match kind {
        JobKind::Continuous => site.continuous().list_jobs()?,
        JobKind::Triggered => site.triggered().list_jobs()?,
    })
}

/// Find `name` among triggered jobs first, then continuous jobs
fn find_job(site: &Site, name: &str) -> Result<Job> {
    if let Some(job) = site.triggered().get_job(name)? {
        return Ok(job);
    }
    if let Some(job) = site.continuous().get_job(name)? {
        return Ok(job);
    }
    bail!("Job '{}' not found", name)
}

/// List jobs, optionally of one kind
fn list_jobs(site: &Site, kind: Option<JobKind>) -> Result<()> {
    let kinds = match kind {
        Some(kind) => vec![kind],
        None => JobKind::all().to_vec(),
    };

    let mut jobs = Vec::new();
    for kind in kinds {
        jobs.extend(jobs_of(site, kind)?);
    }

    if jobs.is_empty() {
        println!("{}", "No jobs found.".yellow());
    } else {
        println!("{}", format!("Found {} job(s):", jobs.len()).bold());
        println!();
        for job in jobs {
            print_job_summary(&job);
        }
    }

    Ok(())
}

fn show_job(site: &Site, name: &str) -> Result<()> {
    let job = find_job(site, name)?;
    print_job_details(&job);
    Ok(())
}

fn job_settings(site: &Site, name: &str, set: Vec<String>, unset: Vec<String>) -> Result<()> {
    let job = find_job(site, name)?;
    let jobs = site.jobs(job.kind);
    let mut settings = jobs.get_job_settings(&job.name)?;

    if !set.is_empty() || !unset.is_empty() {
        for pair in &set {
            let Some((key, raw)) = pair.split_once('=') else {
                bail!("Expected KEY=VALUE, got '{}'", pair);
            };
            let value = serde_json::from_str::<Value>(raw)
                .unwrap_or_else(|_| Value::String(raw.to_string()));
            settings.set_setting(key.trim(), value);
        }
        for key in &unset {
            settings.remove_setting(key);
        }
        jobs.set_job_settings(&job.name, &settings)?;
        println!("{} Updated settings of {}", "✓".green(), job.name.bold());
    }

    if settings.is_empty() {
        println!("{}", "No settings.".yellow());
    } else {
        println!("{}", format!("Settings of {}:", job.name).bold());
        for (key, value) in settings.iter() {
            println!("  {} = {}", key.cyan(), value);
        }
    }

    Ok(())
}

fn deploy_job(site: &Site, name: &str, path: &Path, kind: JobKind) -> Result<()> {
    let contents =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|file_name| file_name.to_str())
        .with_context(|| format!("Invalid file name {}", path.display()))?;

    let jobs = site.jobs(kind);
    let job = if file_name.to_ascii_lowercase().ends_with(".zip") {
        jobs.create_or_replace_job_from_zip(name, &contents)?
    } else {
        jobs.create_or_replace_job_from_file(name, file_name, &contents)?
    };

    println!("{} Deployed {} job {}", "✓".green(), kind, job.name.bold());
    if let Some(error) = &job.error {
        println!("  {} {}", "⚠".yellow(), error.yellow());
    }
    Ok(())
}

async fn delete_job(site: &Site, name: &str) -> Result<()> {
    let job = find_job(site, name)?;
    match job.kind {
        JobKind::Continuous => site.continuous().delete_job(&job.name).await?,
        JobKind::Triggered => site.triggered().delete_job(&job.name)?,
    }
    println!("{} Deleted job {}", "✓".green(), job.name.bold());
    Ok(())
}

/// Run a triggered job in this process and wait for it
async fn invoke_job(site: &Site, name: &str, args: Option<String>) -> Result<()> {
    let handle = site
        .triggered()
        .invoke_triggered_job(name, args, Some("CLI".to_string()))
        .await?;
    let job_name = handle.job_name.clone();
    let run_id = handle.run_id.clone();
    println!(
        "{} Started run {} of {}",
        "▸".cyan(),
        run_id.dimmed(),
        job_name.bold()
    );

    let completion = handle.wait();
    tokio::pin!(completion);
    let status = tokio::select! {
        status = &mut completion => status?,
        _ = tokio::signal::ctrl_c() => {
            println!("{}", "Stopping run...".yellow());
            site.triggered().stop_job_run(&job_name);
            completion.await?
        }
    };

    match site.triggered().get_run(&job_name, &run_id)? {
        Some(run) => print_run(&run),
        None => println!("  Status: {}", colorize_run_status(&status)),
    }

    if status != RunStatus::Success {
        bail!("Run {} of {} finished as {}", run_id, job_name, status);
    }
    Ok(())
}

fn job_history(site: &Site, name: &str) -> Result<()> {
    let history = site.triggered().history(name)?;

    if history.runs.is_empty() {
        println!("{}", format!("No runs found for {}.", name).yellow());
    } else {
        println!(
            "{}",
            format!("Found {} run(s) of {}:", history.runs.len(), name).bold()
        );
        println!();
        for run in &history.runs {
            print_run(run);
        }
    }

    Ok(())
}

async fn disable_job(site: &Site, name: &str) -> Result<()> {
    site.continuous().disable_job(name).await?;
    println!("{} Disabled continuous job {}", "✓".green(), name.bold());
    Ok(())
}

/// Remove the disable marker; starting the job is left to the agent
fn enable_job(site: &Site, name: &str) -> Result<()> {
    let jobs = site.jobs(JobKind::Continuous);
    if !jobs.has_job(name)? {
        bail!("Continuous job '{}' not found", name);
    }
    for source in jobs.sources() {
        if let Ok(dir) = source.job_path(name) {
            site.fs().remove_file_if_exists(&dir.join(DISABLE_FILE_NAME))?;
        }
    }
    jobs.invalidate_cache();
    println!("{} Enabled continuous job {}", "✓".green(), name.bold());
    Ok(())
}

// =============================================================================
// Output
// =============================================================================

fn print_job_summary(job: &Job) {
    println!("  {} {} {}", "▸".cyan(), job.name.bold(), format!("({})", job.kind).dimmed());
    match &job.detail {
        JobDetail::Continuous { status, .. } => {
            println!("    Status:     {}", colorize_continuous_status(status));
        }
        JobDetail::Triggered { latest_run, .. } => match latest_run {
            Some(run) => println!(
                "    Latest run: {} {}",
                colorize_run_status(&run.status),
                run.start_time
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
                    .dimmed()
            ),
            None => println!("    Latest run: {}", "never".dimmed()),
        },
    }
    if let Some(schedule) = job.settings.schedule() {
        println!("    Schedule:   {}", schedule.cyan());
    }
    if let Some(error) = &job.error {
        println!("    Error:      {}", error.red());
    }
    println!();
}

fn print_job_details(job: &Job) {
    println!("{}", "Job Details:".bold());
    println!("  Name:        {}", job.name.cyan());
    println!("  Kind:        {}", job.kind);
    if let Some(host) = &job.script_host {
        println!("  Script host: {}", host);
    }
    if let Some(script) = &job.script_file_path {
        println!("  Script:      {}", script.display());
    }
    if let Some(command) = &job.run_command {
        println!("  Command:     {}", command.dimmed());
    }
    if let Some(source) = &job.source {
        println!("  Source:      {}", source);
    }
    if let Some(url) = &job.url {
        println!("  URL:         {}", url.dimmed());
    }
    if let Some(extra_info_url) = &job.extra_info_url {
        println!("  Extra info:  {}", extra_info_url.dimmed());
    }

    match &job.detail {
        JobDetail::Continuous { status, log_url } => {
            println!("  Status:      {}", colorize_continuous_status(status));
            if let Some(log_url) = log_url {
                println!("  Log:         {}", log_url.dimmed());
            }
        }
        JobDetail::Triggered { latest_run, .. } => {
            if let Some(run) = latest_run {
                println!("\n{}", "Latest Run:".bold());
                print_run(run);
            }
        }
    }

    if !job.settings.is_empty() {
        println!("\n{}", "Settings:".bold());
        for (key, value) in job.settings.iter() {
            println!("  {} = {}", key.cyan(), value);
        }
    }

    if let Some(error) = &job.error {
        println!("\n{}", "Error:".bold());
        println!("{}", error.red());
    }
}

fn print_run(run: &TriggeredJobRun) {
    println!("  {} Run {}", "▸".cyan(), run.id.dimmed());
    println!("    Status:    {}", colorize_run_status(&run.status));
    if let Some(trigger) = &run.trigger {
        println!("    Trigger:   {}", trigger);
    }
    println!(
        "    Started:   {}",
        run.start_time.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(duration) = run.duration() {
        println!("    Duration:  {}s", duration.num_seconds());
    }
    if let Some(exit_code) = run.exit_code {
        println!("    Exit Code: {}", exit_code);
    }
    println!();
}

/// Colorize run status for display
fn colorize_run_status(status: &RunStatus) -> colored::ColoredString {
    let status_str = status.to_string();
    match status {
        RunStatus::Pending => status_str.yellow(),
        RunStatus::Running => status_str.cyan(),
        RunStatus::Success => status_str.green(),
        RunStatus::Failed => status_str.red(),
        RunStatus::Aborted => status_str.dimmed(),
    }
}

fn colorize_continuous_status(status: &ContinuousStatus) -> colored::ColoredString {
    let status_str = status.to_string();
    match status {
        ContinuousStatus::Running => status_str.green(),
        ContinuousStatus::Initializing | ContinuousStatus::Starting => status_str.cyan(),
        ContinuousStatus::PendingRestart => status_str.yellow(),
        ContinuousStatus::Stopped => status_str.dimmed(),
        ContinuousStatus::Disabled => status_str.red(),
    }
}
