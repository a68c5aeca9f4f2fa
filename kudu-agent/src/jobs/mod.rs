//! WebJobs
//!
//! - [`JobsManager`]: definitions of one kind in one jobs tree
//! - [`AggregateJobsManager`]: primary and secondary trees as one
//! - [`JobsWatcher`]: polling change detection feeding the managers' observers
//! - [`TriggeredJobsManager`]: lock-guarded triggered runs and their history
//! - [`AggregateContinuousJobsManager`]: continuous job supervisor

mod aggregate;
mod continuous;
mod history;
mod manager;
pub mod script_host;
mod triggered;
mod watcher;

pub use aggregate::AggregateJobsManager;
pub use continuous::{AggregateContinuousJobsManager, ContinuousPolicy};
pub use history::{RunHistory, RunLogger};
pub use manager::{ChangeCallback, JobChange, JobsManager, ObserverToken, SOURCE_FILE_NAME};
pub use triggered::{TriggeredJobsManager, TriggeredPolicy, TriggeredRunHandle, run_lock_name};
pub use watcher::JobsWatcher;

#[cfg(test)]
pub(crate) use triggered::testing as triggered_testing;

use kudu_core::domain::job::Job;
use std::path::{Path, PathBuf};

use crate::error::{CoordinatorError, Result};
use crate::fs::FileSystem;
use script_host::find_host;

/// Process to start for a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JobCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

/// Resolve the job's script host and working directory
///
/// Unless the job runs in place, its directory is copied to `temp_dir` first
/// so uploads can replace the job while it runs.
pub(crate) fn prepare_command(
    fs: &dyn FileSystem,
    job: &Job,
    temp_dir: &Path,
    arguments: Option<&str>,
) -> Result<JobCommand> {
    let script = job.script_file_path.as_ref().ok_or_else(|| {
        CoordinatorError::Validation(format!("job '{}' has no runnable script", job.name))
    })?;
    let job_dir = script
        .parent()
        .ok_or_else(|| CoordinatorError::Internal(format!("bad script path for '{}'", job.name)))?;
    let host = job
        .script_host
        .as_deref()
        .and_then(find_host)
        .ok_or_else(|| CoordinatorError::Internal(format!("no script host for '{}'", job.name)))?;

    let working_dir = if job.settings.is_in_place() {
        job_dir.to_path_buf()
    } else {
        fs.remove_dir_all_if_exists(temp_dir)?;
        fs.copy_dir_all(job_dir, temp_dir)?;
        temp_dir.to_path_buf()
    };
    let relative = script.strip_prefix(job_dir).unwrap_or(script);
    let (program, args) = host.command(&working_dir.join(relative), arguments);

    Ok(JobCommand {
        program,
        args,
        working_dir,
    })
}

/// Variables every job process receives
pub(crate) fn job_environment(
    job: &Job,
    data_path: &Path,
    run_id: Option<&str>,
    arguments: Option<&str>,
    shutdown_file: &Path,
) -> Vec<(String, String)> {
    let mut env = vec![
        ("WEBJOBS_NAME".to_string(), job.name.clone()),
        ("WEBJOBS_TYPE".to_string(), job.kind.to_string()),
        (
            "WEBJOBS_DATA_PATH".to_string(),
            data_path.to_string_lossy().into_owned(),
        ),
        (
            "WEBJOBS_SHUTDOWN_FILE".to_string(),
            shutdown_file.to_string_lossy().into_owned(),
        ),
    ];
    if let Some(run_id) = run_id {
        env.push(("WEBJOBS_RUN_ID".to_string(), run_id.to_string()));
    }
    if let Some(arguments) = arguments {
        env.push((
            "WEBJOBS_COMMAND_ARGUMENTS".to_string(),
            arguments.to_string(),
        ));
    }
    env
}
