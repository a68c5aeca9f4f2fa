//! Triggered jobs
//!
//! Manual and scheduled invocations share one path: the per-job run lock
//! `triggered.{name}` is acquired with a short timeout, a run record is
//! created, and the process runs in a detached task that releases the lock
//! when the run reaches a terminal state.

use chrono::{DateTime, Utc};
use kudu_core::domain::job::{Job, JobDetail, JobKind};
use kudu_core::domain::run::{RunStatus, TriggeredJobRun};
use kudu_core::dto::job::{InvokeJobResponse, TriggeredJobHistory};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::aggregate::AggregateJobsManager;
use super::history::{RunHistory, RunLogger};
use super::{job_environment, prepare_command};
use crate::config::Config;
use crate::error::{CoordinatorError, Result};
use crate::fs::FileSystem;
use crate::lock::{LockProvider, OperationLock, acquire_guard};
use crate::service::{ExecutionRequest, ExitOutcome, JobExecutor, OutputSink};

/// Name of the lock serializing runs of a triggered job
pub fn run_lock_name(job_name: &str) -> String {
    format!("triggered.{}", job_name.to_ascii_lowercase())
}

/// Run policy for triggered jobs
#[derive(Debug, Clone)]
pub struct TriggeredPolicy {
    pub history_size: usize,
    /// A run with no output for this long is stopped
    pub idle_timeout: Duration,
    pub run_lock_timeout: Duration,
    pub default_stopping_wait: Duration,
    /// How often a running job renews its run lock
    pub lock_renew_interval: Duration,
}

impl TriggeredPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            history_size: config.job_history_size,
            idle_timeout: config.idle_timeout,
            run_lock_timeout: config.run_lock_timeout,
            default_stopping_wait: config.default_stopping_wait,
            lock_renew_interval: (config.lock_stale_after / 3).max(Duration::from_secs(1)),
        }
    }
}

/// A started run
#[derive(Debug)]
pub struct TriggeredRunHandle {
    pub job_name: String,
    pub run_id: String,
    completion: JoinHandle<RunStatus>,
}

impl TriggeredRunHandle {
    pub fn response(&self) -> InvokeJobResponse {
        InvokeJobResponse {
            job_name: self.job_name.clone(),
            run_id: self.run_id.clone(),
        }
    }

    /// Wait for the run's terminal status
    pub async fn wait(self) -> Result<RunStatus> {
        self.completion
            .await
            .map_err(|e| CoordinatorError::Internal(format!("run task failed: {}", e)))
    }
}

struct ActiveRun {
    run_id: String,
    cancel: CancellationToken,
}

pub struct TriggeredJobsManager {
    jobs: Arc<AggregateJobsManager>,
    history: RunHistory,
    fs: Arc<dyn FileSystem>,
    locks: Arc<dyn LockProvider>,
    executor: Arc<dyn JobExecutor>,
    policy: TriggeredPolicy,
    temp_path: PathBuf,
    active: Mutex<HashMap<String, ActiveRun>>,
}

impl TriggeredJobsManager {
    pub fn new(
        jobs: Arc<AggregateJobsManager>,
        history: RunHistory,
        fs: Arc<dyn FileSystem>,
        locks: Arc<dyn LockProvider>,
        executor: Arc<dyn JobExecutor>,
        policy: TriggeredPolicy,
        temp_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            jobs,
            history,
            fs,
            locks,
            executor,
            policy,
            temp_path: temp_path.into(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn jobs(&self) -> &Arc<AggregateJobsManager> {
        &self.jobs
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_lock(&self, job_name: &str) -> Arc<dyn OperationLock> {
        self.locks.get_lock(&run_lock_name(job_name))
    }

    fn require_job(&self, name: &str) -> Result<Job> {
        self.jobs
            .get_job(name)?
            .ok_or_else(|| CoordinatorError::JobNotFound(name.to_string()))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Triggered jobs with their latest run
    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        self.jobs
            .list_jobs(false)?
            .into_iter()
            .map(|job| self.with_latest_run(job))
            .collect()
    }

    pub fn get_job(&self, name: &str) -> Result<Option<Job>> {
        self.jobs
            .get_job(name)?
            .map(|job| self.with_latest_run(job))
            .transpose()
    }

    /// Runs of `name`, newest first
    pub fn history(&self, name: &str) -> Result<TriggeredJobHistory> {
        let job = self.require_job(name)?;
        Ok(TriggeredJobHistory {
            runs: self.runs_of(&job)?,
        })
    }

    pub fn get_run(&self, name: &str, run_id: &str) -> Result<Option<TriggeredJobRun>> {
        let job = self.require_job(name)?;
        Ok(self.runs_of(&job)?.into_iter().find(|run| run.id == run_id))
    }

    /// Start time of the newest recorded run
    pub fn latest_run_start(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .history
            .runs(name)?
            .into_iter()
            .next()
            .map(|(_, status)| status.start_time))
    }

    /// Whether any process currently holds the job's run lock
    pub fn is_running(&self, name: &str) -> bool {
        self.run_lock(name).is_held()
    }

    fn with_latest_run(&self, mut job: Job) -> Result<Job> {
        let latest = self.runs_of(&job)?.into_iter().next();
        if let JobDetail::Triggered { latest_run, .. } = &mut job.detail {
            *latest_run = latest;
        }
        Ok(job)
    }

    /// Recorded runs as reported to callers
    ///
    /// A non-terminal run is `Aborted` unless it is the newest run and the
    /// run lock is held: its process went away without recording an outcome.
    fn runs_of(&self, job: &Job) -> Result<Vec<TriggeredJobRun>> {
        let lock_held = self.run_lock(&job.name).is_held();
        let runs = self.history.runs(&job.name)?;

        Ok(runs
            .into_iter()
            .enumerate()
            .map(|(index, (id, status))| {
                let mut run = TriggeredJobRun::from_status(id, &job.name, status);
                if !run.status.is_terminal() && (index > 0 || !lock_held) {
                    run.status = RunStatus::Aborted;
                }
                if let Some(url) = &job.url {
                    let run_url = format!("{}/history/{}", url, run.id);
                    run.output_url = Some(format!("{}/output", run_url));
                    run.error_url = Some(format!("{}/error", run_url));
                    run.url = Some(run_url);
                }
                run
            })
            .collect())
    }

    // =========================================================================
    // Invocation
    // =========================================================================

    /// Start a run of `name`
    ///
    /// Fails with `Busy` when another run (from any process) holds the run
    /// lock past the run lock timeout.
    #[instrument(skip(self, arguments))]
    pub async fn invoke_triggered_job(
        self: &Arc<Self>,
        name: &str,
        arguments: Option<String>,
        trigger: Option<String>,
    ) -> Result<TriggeredRunHandle> {
        let job = self.require_job(name)?;
        if !job.is_runnable() {
            return Err(CoordinatorError::Validation(job.error.clone().unwrap_or_else(
                || format!("job '{}' has no runnable script", job.name),
            )));
        }

        let lock = self.run_lock(&job.name);
        let Some(guard) = acquire_guard(&lock, "run", self.policy.run_lock_timeout).await? else {
            debug!("Triggered job {} is already running", job.name);
            return Err(CoordinatorError::busy(format!(
                "run of triggered job '{}'",
                job.name
            )));
        };

        let logger = Arc::new(self.history.start_run(
            &job.name,
            trigger,
            Utc::now(),
            self.policy.history_size,
        )?);
        let run_id = logger.id().to_string();
        let cancel = CancellationToken::new();
        self.active().insert(
            job.name.to_ascii_lowercase(),
            ActiveRun {
                run_id: run_id.clone(),
                cancel: cancel.clone(),
            },
        );
        info!("Invoking triggered job {} (run {})", job.name, run_id);

        let manager = Arc::clone(self);
        let job_name = job.name.clone();
        let completion = tokio::spawn(async move {
            let renewal = guard.spawn_renewal(manager.policy.lock_renew_interval);
            let status = manager.execute_run(&job, &logger, arguments, cancel).await;
            renewal.abort();
            manager.active().remove(&job.name.to_ascii_lowercase());
            drop(guard);
            status
        });

        Ok(TriggeredRunHandle {
            job_name,
            run_id,
            completion,
        })
    }

    /// Request a graceful stop of the run started by this process
    pub fn stop_job_run(&self, name: &str) -> bool {
        match self.active().get(&name.to_ascii_lowercase()) {
            Some(run) => {
                info!("Stopping run {} of triggered job {}", run.run_id, name);
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Stop any local run, then delete the job
    pub fn delete_job(&self, name: &str) -> Result<()> {
        self.stop_job_run(name);
        self.jobs.delete_job(name)
    }

    async fn execute_run(
        &self,
        job: &Job,
        logger: &Arc<RunLogger>,
        arguments: Option<String>,
        cancel: CancellationToken,
    ) -> RunStatus {
        if let Err(e) = logger.transition(RunStatus::Running, Utc::now()) {
            warn!("Failed to record start of {}: {}", job.name, e);
        }

        let outcome = self
            .run_process(job, logger, arguments.as_deref(), cancel)
            .await;

        let (status, exit_code) = match outcome {
            Ok(ExitOutcome::Exited { code: Some(0) }) => (RunStatus::Success, Some(0)),
            Ok(ExitOutcome::Exited { code }) => {
                let code_text = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
                logger.system(&format!("Process exited with code {}", code_text));
                (RunStatus::Failed, code)
            }
            Ok(ExitOutcome::IdleTimeout) => {
                logger.system(&format!(
                    "Job was stopped after {}s without output",
                    self.policy.idle_timeout.as_secs()
                ));
                (RunStatus::Failed, None)
            }
            Ok(ExitOutcome::TimedOut) => {
                logger.system("Job was stopped after exceeding its timeout");
                (RunStatus::Failed, None)
            }
            Ok(ExitOutcome::Cancelled) => {
                logger.system("Job was stopped");
                (RunStatus::Aborted, None)
            }
            Err(e) => {
                error!("Failed to run triggered job {}: {}", job.name, e);
                logger.system(&format!("Failed to run job: {}", e));
                (RunStatus::Failed, None)
            }
        };

        if let Err(e) = logger.complete(status, exit_code, Utc::now()) {
            error!("Failed to record outcome of {}: {}", job.name, e);
        }
        info!("Triggered job {} run {} finished: {}", job.name, logger.id(), status);
        status
    }

    async fn run_process(
        &self,
        job: &Job,
        logger: &Arc<RunLogger>,
        arguments: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<ExitOutcome> {
        let command = prepare_command(
            self.fs.as_ref(),
            job,
            &self.temp_path.join(&job.name),
            arguments,
        )?;

        let shutdown_file = logger.dir().join("shutdown");
        let env = job_environment(
            job,
            &self.history.job_dir(&job.name),
            Some(logger.id()),
            arguments,
            &shutdown_file,
        );

        let request = ExecutionRequest {
            job_name: job.name.clone(),
            kind: JobKind::Triggered,
            program: command.program,
            args: command.args,
            working_dir: command.working_dir,
            env,
            shutdown_file,
            stopping_wait: job
                .settings
                .stopping_wait_time(self.policy.default_stopping_wait),
            idle_timeout: Some(self.policy.idle_timeout),
            timeout: job.settings.run_timeout(),
            cancel,
        };
        let sink: Arc<dyn OutputSink> = logger.clone();
        Ok(self.executor.execute(request, sink).await?)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::fixture;
    use super::*;
    use kudu_core::domain::settings::{IS_IN_PLACE, JobSettings};
    use std::path::Path;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_invoke_records_successful_run() {
        let f = fixture(Duration::from_millis(10), 0);
        f.jobs
            .create_or_replace_job_from_file("report", "run.sh", b"echo hi")
            .unwrap();

        let handle = f
            .manager
            .invoke_triggered_job("Report", Some("--full".into()), Some("manual".into()))
            .await
            .unwrap();
        let run_id = handle.run_id.clone();
        assert_eq!(handle.response().job_name, "report");
        assert_eq!(handle.wait().await.unwrap(), RunStatus::Success);

        let run = f.manager.get_run("report", &run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.exit_code, Some(0));
        assert_eq!(run.trigger.as_deref(), Some("manual"));
        assert!(run.end_time.unwrap() >= run.start_time);
        assert_eq!(
            run.url.as_deref(),
            Some(format!("https://site/api/triggeredwebjobs/report/history/{}", run_id).as_str())
        );

        let request = &f.executor.requests()[0];
        assert_eq!(
            request.working_dir,
            Path::new("/site/temp/jobs/triggered/report")
        );
        assert_eq!(request.args.last().map(String::as_str), Some("--full"));
        assert!(request
            .env
            .contains(&("WEBJOBS_RUN_ID".to_string(), run_id.clone())));
        assert!(f
            .fs
            .exists(Path::new("/site/temp/jobs/triggered/report/run.sh")));

        let job = f.manager.get_job("report").unwrap().unwrap();
        assert_eq!(job.latest_run().unwrap().id, run_id);
        assert!(!f.manager.is_running("report"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_run() {
        let f = fixture(Duration::from_millis(1), 3);
        f.jobs
            .create_or_replace_job_from_file("report", "run.sh", b"")
            .unwrap();

        let handle = f
            .manager
            .invoke_triggered_job("report", None, None)
            .await
            .unwrap();
        assert_eq!(handle.wait().await.unwrap(), RunStatus::Failed);

        let history = f.manager.history("report").unwrap();
        assert_eq!(history.runs.len(), 1);
        assert_eq!(history.runs[0].exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_overlapping_invocation_is_busy() {
        let f = fixture(Duration::from_millis(300), 0);
        f.jobs
            .create_or_replace_job_from_file("report", "run.sh", b"")
            .unwrap();

        let first = f
            .manager
            .invoke_triggered_job("report", None, None)
            .await
            .unwrap();
        assert!(f.manager.is_running("report"));
        let err = f
            .manager
            .invoke_triggered_job("report", None, None)
            .await
            .unwrap_err();
        assert!(err.is_busy());

        first.wait().await.unwrap();
        let lock = f.locks.tracking(&run_lock_name("report"));
        assert_eq!(lock.max_holders.load(Ordering::SeqCst), 1);
        assert_eq!(f.executor.executions.load(Ordering::SeqCst), 1);
        assert_eq!(f.manager.history("report").unwrap().runs.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_and_unrunnable_jobs() {
        let f = fixture(Duration::from_millis(1), 0);
        assert!(matches!(
            f.manager.invoke_triggered_job("ghost", None, None).await,
            Err(CoordinatorError::JobNotFound(_))
        ));

        f.jobs
            .create_or_replace_job_from_file("docs", "README.md", b"")
            .unwrap();
        assert!(matches!(
            f.manager.invoke_triggered_job("docs", None, None).await,
            Err(CoordinatorError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_aborts_run() {
        let f = fixture(Duration::from_secs(30), 0);
        f.jobs
            .create_or_replace_job_from_file("long", "run.sh", b"")
            .unwrap();

        let handle = f
            .manager
            .invoke_triggered_job("long", None, None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.manager.stop_job_run("LONG"));

        assert_eq!(handle.wait().await.unwrap(), RunStatus::Aborted);
        assert!(!f.manager.stop_job_run("long"));
    }

    #[tokio::test]
    async fn test_in_place_runs_from_job_directory() {
        let f = fixture(Duration::from_millis(1), 0);
        f.jobs
            .create_or_replace_job_from_file("inplace", "run.sh", b"")
            .unwrap();
        let mut settings = JobSettings::new();
        settings.set_setting(IS_IN_PLACE, true);
        f.jobs.set_job_settings("inplace", &settings).unwrap();

        let handle = f
            .manager
            .invoke_triggered_job("inplace", None, None)
            .await
            .unwrap();
        handle.wait().await.unwrap();

        assert_eq!(
            f.executor.requests()[0].working_dir,
            Path::new("/site/jobs/triggered/inplace")
        );
    }

    #[tokio::test]
    async fn test_orphaned_running_run_reported_aborted() {
        let f = fixture(Duration::from_millis(1), 0);
        f.jobs
            .create_or_replace_job_from_file("report", "run.sh", b"")
            .unwrap();
        f.fs.write(
            Path::new("/site/data/jobs/triggered/report/20240101000000000000/status"),
            br#"{"status":"Running","startTime":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let runs = f.manager.history("report").unwrap().runs;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Aborted);
    }
}
