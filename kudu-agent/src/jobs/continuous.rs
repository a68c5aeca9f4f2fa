//! Continuous job supervisor
//!
//! One runner task per (source, job). A runner starts the job process,
//! restarts it after the restart interval when it exits, and stops it
//! gracefully when cancelled. Runners are reconciled against the job trees
//! on start and whenever a source reports a change:
//! - New or re-enabled jobs get a runner
//! - Changed jobs are stopped and started again
//! - Deleted and disabled jobs are stopped
//!
//! A job with `is_singleton` holds the lock `continuous.{name}.singleton`
//! while its process runs, so only one instance runs across all sources and
//! processes; the others wait in `PendingRestart`.

use chrono::Utc;
use kudu_core::domain::job::{ContinuousJobState, ContinuousStatus, DISABLE_FILE_NAME, Job, JobDetail, JobKind};
use kudu_core::domain::run::STATUS_FILE_NAME;
use kudu_core::dto::proxy::{ProxyRequest, ProxyResponse};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::aggregate::AggregateJobsManager;
use super::manager::{JobsManager, ObserverToken};
use super::{job_environment, prepare_command};
use crate::config::Config;
use crate::error::{CoordinatorError, Result};
use crate::fs::{FileSystem, read_optional};
use crate::lock::{LockProvider, acquire_guard};
use crate::service::{ExecutionRequest, ExitOutcome, JobEndpoint, JobExecutor, OutputSink};

/// Output of a continuous job, in its data directory
pub const LOG_FILE_NAME: &str = "job_log.txt";

/// Previous log, replaced each time the current one rolls over
pub const PREV_LOG_FILE_NAME: &str = "job_prev_log.txt";

/// Size at which the log rolls over
pub const MAX_LOG_FILE_SIZE: u64 = 1024 * 1024;

/// Name of the lock held by the running instance of a singleton job
pub fn singleton_lock_name(job_name: &str) -> String {
    format!("continuous.{}.singleton", job_name.to_ascii_lowercase())
}

#[derive(Debug, Clone)]
pub struct ContinuousPolicy {
    /// Wait before restarting an exited process, or retrying a busy singleton
    pub restart_interval: Duration,
    pub default_stopping_wait: Duration,
    pub lock_renew_interval: Duration,
}

impl ContinuousPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            restart_interval: config.restart_interval,
            default_stopping_wait: config.default_stopping_wait,
            lock_renew_interval: (config.lock_stale_after / 3).max(Duration::from_secs(1)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RunnerState {
    status: ContinuousStatus,
    port: Option<u16>,
}

/// (source label, lowercase job name)
type RunnerKey = (String, String);

struct Runner {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    state: Arc<Mutex<RunnerState>>,
}

impl Runner {
    fn state(&self) -> RunnerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Appends a continuous job's output to its log
///
/// Once the log would grow past `max_size` it is moved to
/// [`PREV_LOG_FILE_NAME`] and a fresh log is started.
struct ContinuousLog {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    prev_path: PathBuf,
    max_size: u64,
    source: String,
}

impl ContinuousLog {
    fn new(fs: Arc<dyn FileSystem>, data_dir: &Path, source: &str) -> Self {
        Self {
            fs,
            path: data_dir.join(LOG_FILE_NAME),
            prev_path: data_dir.join(PREV_LOG_FILE_NAME),
            max_size: MAX_LOG_FILE_SIZE,
            source: source.to_string(),
        }
    }

    fn roll_if_full(&self, incoming: usize) {
        let Ok(len) = self.fs.file_len(&self.path) else {
            return;
        };
        if len + incoming as u64 <= self.max_size {
            return;
        }
        if let Err(e) = self.fs.rename(&self.path, &self.prev_path) {
            warn!("Failed to roll {}: {}", self.path.display(), e);
        }
    }

    fn append(&self, level: &str, line: &str) {
        let line = format!("[{}] [{}] {} {}\n", Utc::now().to_rfc3339(), self.source, level, line);
        self.roll_if_full(line.len());
        if let Err(e) = self.fs.append(&self.path, line.as_bytes()) {
            warn!("Failed to write {}: {}", self.path.display(), e);
        }
    }
}

impl OutputSink for ContinuousLog {
    fn stdout_line(&self, line: &str) {
        self.append("INFO", line);
    }

    fn stderr_line(&self, line: &str) {
        self.append("ERR", line);
    }
}

fn allocate_port() -> io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

pub struct AggregateContinuousJobsManager {
    jobs: Arc<AggregateJobsManager>,
    fs: Arc<dyn FileSystem>,
    locks: Arc<dyn LockProvider>,
    executor: Arc<dyn JobExecutor>,
    endpoint: Arc<dyn JobEndpoint>,
    policy: ContinuousPolicy,
    data_path: PathBuf,
    temp_path: PathBuf,
    runners: Mutex<HashMap<RunnerKey, Runner>>,
    observers: Mutex<Vec<ObserverToken>>,
}

impl AggregateContinuousJobsManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<AggregateJobsManager>,
        fs: Arc<dyn FileSystem>,
        locks: Arc<dyn LockProvider>,
        executor: Arc<dyn JobExecutor>,
        endpoint: Arc<dyn JobEndpoint>,
        policy: ContinuousPolicy,
        data_path: impl Into<PathBuf>,
        temp_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            jobs,
            fs,
            locks,
            executor,
            endpoint,
            policy,
            data_path: data_path.into(),
            temp_path: temp_path.into(),
            runners: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn jobs(&self) -> &Arc<AggregateJobsManager> {
        &self.jobs
    }

    fn runners(&self) -> MutexGuard<'_, HashMap<RunnerKey, Runner>> {
        self.runners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_job(&self, name: &str) -> Result<Job> {
        self.jobs
            .get_job(name)?
            .ok_or_else(|| CoordinatorError::JobNotFound(name.to_string()))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start every enabled job and follow changes until `shutdown`
    ///
    /// On shutdown all runners are stopped before the returned task ends.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Option<String>>();
        let tokens = self.jobs.register_change_observer(move |change| {
            let _ = tx.send(change.name.clone());
        });
        *self.observers.lock().unwrap_or_else(PoisonError::into_inner) = tokens;

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.reconcile().await {
                error!("Failed to start continuous jobs: {}", e);
            }
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(first) = rx.recv() => {
                        let mut changes = vec![first];
                        while let Ok(next) = rx.try_recv() {
                            changes.push(next);
                        }
                        manager.apply_changes(changes).await;
                    }
                }
            }
            manager.shutdown().await;
        })
    }

    async fn apply_changes(self: &Arc<Self>, changes: Vec<Option<String>>) {
        let result = if changes.iter().any(Option::is_none) {
            self.refresh_all().await
        } else {
            let names: BTreeSet<String> = changes
                .into_iter()
                .flatten()
                .map(|name| name.to_ascii_lowercase())
                .collect();
            let mut result = Ok(());
            for name in names {
                if let Err(e) = self.refresh_job(&name).await {
                    result = Err(e);
                }
            }
            result
        };
        if let Err(e) = result {
            error!("Failed to apply continuous job changes: {}", e);
        }
    }

    /// Bring runners in line with the job trees
    #[instrument(skip(self))]
    pub async fn reconcile(self: &Arc<Self>) -> Result<()> {
        let mut desired: HashMap<RunnerKey, (Arc<JobsManager>, Job)> = HashMap::new();
        for source in self.jobs.sources() {
            for job in source.list_jobs(false)? {
                if !job.is_runnable() || self.is_disabled(source, &job.name) {
                    continue;
                }
                let key = (source.label().to_string(), job.name.to_ascii_lowercase());
                desired.insert(key, (Arc::clone(source), job));
            }
        }

        let stale: Vec<Runner> = {
            let mut runners = self.runners();
            let keys: Vec<RunnerKey> = runners
                .keys()
                .filter(|key| !desired.contains_key(*key))
                .cloned()
                .collect();
            keys.iter().filter_map(|key| runners.remove(key)).collect()
        };
        Self::stop_runners(stale).await;

        let mut runners = self.runners();
        for (key, (source, job)) in desired {
            if !runners.contains_key(&key) {
                let runner = self.spawn_runner(source.label(), job);
                runners.insert(key, runner);
            }
        }
        Ok(())
    }

    /// Stop and restart every instance of `name`
    pub async fn refresh_job(self: &Arc<Self>, name: &str) -> Result<()> {
        let name = name.to_ascii_lowercase();
        let stopped = self.take_runners(|(_, job)| *job == name);
        if !stopped.is_empty() {
            info!("Restarting continuous job {}", name);
        }
        Self::stop_runners(stopped).await;
        self.reconcile().await
    }

    async fn refresh_all(self: &Arc<Self>) -> Result<()> {
        let stopped = self.take_runners(|_| true);
        Self::stop_runners(stopped).await;
        self.reconcile().await
    }

    /// Stop every runner and stop following changes
    pub async fn shutdown(&self) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let runners = self.take_runners(|_| true);
        if !runners.is_empty() {
            info!("Stopping {} continuous job instance(s)", runners.len());
        }
        Self::stop_runners(runners).await;
    }

    fn take_runners<F>(&self, matches: F) -> Vec<Runner>
    where
        F: Fn(&RunnerKey) -> bool,
    {
        let mut runners = self.runners();
        let keys: Vec<RunnerKey> = runners.keys().filter(|key| matches(key)).cloned().collect();
        keys.iter().filter_map(|key| runners.remove(key)).collect()
    }

    async fn stop_runners(runners: Vec<Runner>) {
        for runner in &runners {
            runner.cancel.cancel();
        }
        for runner in runners {
            if let Err(e) = runner.task.await {
                error!("Continuous job runner failed: {}", e);
            }
        }
    }

    // =========================================================================
    // Enable / disable / delete
    // =========================================================================

    fn is_disabled(&self, source: &JobsManager, name: &str) -> bool {
        self.fs
            .exists(&source.binaries_path().join(name).join(DISABLE_FILE_NAME))
    }

    /// Write the disable marker and stop every instance
    #[instrument(skip(self))]
    pub async fn disable_job(self: &Arc<Self>, name: &str) -> Result<()> {
        let job = self.require_job(name)?;
        for source in self.jobs.sources() {
            if let Ok(dir) = source.job_path(name) {
                self.fs.write(&dir.join(DISABLE_FILE_NAME), b"")?;
            }
        }

        let key = job.name.to_ascii_lowercase();
        let stopped = self.take_runners(|(_, runner_job)| *runner_job == key);
        Self::stop_runners(stopped).await;
        self.write_status(&job.name, None, ContinuousStatus::Disabled);
        info!("Disabled continuous job {}", job.name);
        Ok(())
    }

    /// Remove the disable marker and start the job
    #[instrument(skip(self))]
    pub async fn enable_job(self: &Arc<Self>, name: &str) -> Result<()> {
        let job = self.require_job(name)?;
        for source in self.jobs.sources() {
            if let Ok(dir) = source.job_path(name) {
                self.fs.remove_file_if_exists(&dir.join(DISABLE_FILE_NAME))?;
            }
        }
        self.write_status(&job.name, None, ContinuousStatus::Stopped);
        info!("Enabled continuous job {}", job.name);
        self.reconcile().await
    }

    /// Stop every instance, then delete the job
    pub async fn delete_job(&self, name: &str) -> Result<()> {
        let key = name.to_ascii_lowercase();
        let stopped = self.take_runners(|(_, job)| *job == key);
        Self::stop_runners(stopped).await;
        self.jobs.delete_job(name)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Continuous jobs with their current status
    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self
            .jobs
            .list_jobs(false)?
            .into_iter()
            .map(|job| self.with_status(job))
            .collect())
    }

    pub fn get_job(&self, name: &str) -> Result<Option<Job>> {
        Ok(self.jobs.get_job(name)?.map(|job| self.with_status(job)))
    }

    fn with_status(&self, mut job: Job) -> Job {
        let current = self.status_of(&job.name);
        if let JobDetail::Continuous { status, .. } = &mut job.detail {
            *status = current;
        }
        job
    }

    /// Local instances first, then the disable marker, then the status file
    pub fn status_of(&self, name: &str) -> ContinuousStatus {
        let key = name.to_ascii_lowercase();
        let local: Vec<ContinuousStatus> = self
            .runners()
            .iter()
            .filter(|((_, job), _)| *job == key)
            .map(|(_, runner)| runner.state().status)
            .collect();
        if local.contains(&ContinuousStatus::Running) {
            return ContinuousStatus::Running;
        }
        if let Some(status) = local.first() {
            return *status;
        }

        let disabled = self.jobs.sources().iter().any(|source| {
            source
                .job_path(name)
                .is_ok_and(|dir| self.fs.exists(&dir.join(DISABLE_FILE_NAME)))
        });
        if disabled {
            return ContinuousStatus::Disabled;
        }

        match read_optional(self.fs.as_ref(), &self.status_path(name)) {
            Ok(Some(data)) => serde_json::from_slice::<ContinuousJobState>(&data)
                .map(|state| state.status)
                .unwrap_or(ContinuousStatus::Stopped),
            _ => ContinuousStatus::Stopped,
        }
    }

    fn status_path(&self, name: &str) -> PathBuf {
        self.data_path.join(name).join(STATUS_FILE_NAME)
    }

    fn write_status(&self, name: &str, source: Option<&str>, status: ContinuousStatus) {
        let state = ContinuousJobState {
            status,
            source: source.map(str::to_string),
            pid: Some(std::process::id()),
        };
        let result = serde_json::to_vec_pretty(&state)
            .map_err(io::Error::other)
            .and_then(|data| self.fs.write_atomic(&self.status_path(name), &data));
        if let Err(e) = result {
            warn!("Failed to record status of {}: {}", name, e);
        }
    }

    // =========================================================================
    // HTTP pass-through
    // =========================================================================

    /// Forward `request` to the job's local HTTP endpoint
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn handle_request(&self, name: &str, request: ProxyRequest) -> Result<ProxyResponse> {
        let job = self.require_job(name)?;
        if !job.settings.expose_http() {
            return Err(CoordinatorError::Validation(format!(
                "job '{}' does not expose an HTTP endpoint",
                job.name
            )));
        }

        let key = job.name.to_ascii_lowercase();
        let port = self
            .runners()
            .iter()
            .filter(|((_, runner_job), _)| *runner_job == key)
            .map(|(_, runner)| runner.state())
            .find(|state| state.status == ContinuousStatus::Running)
            .and_then(|state| state.port);
        let Some(port) = port else {
            return Err(CoordinatorError::Unavailable(format!(
                "job '{}' is not running",
                job.name
            )));
        };

        debug!("Forwarding request to {} on port {}", job.name, port);
        Ok(self.endpoint.forward(port, &request).await?)
    }

    // =========================================================================
    // Runners
    // =========================================================================

    fn spawn_runner(self: &Arc<Self>, source: &str, job: Job) -> Runner {
        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(RunnerState {
            status: ContinuousStatus::Initializing,
            port: None,
        }));
        debug!("Starting runner for {} from {}", job.name, source);

        let task = tokio::spawn(Arc::clone(self).run_instance(
            source.to_string(),
            job,
            cancel.clone(),
            Arc::clone(&state),
        ));
        Runner {
            cancel,
            task,
            state,
        }
    }

    fn set_status(
        &self,
        job: &Job,
        source: &str,
        state: &Mutex<RunnerState>,
        status: ContinuousStatus,
    ) {
        state.lock().unwrap_or_else(PoisonError::into_inner).status = status;
        self.write_status(&job.name, Some(source), status);
    }

    /// Sleep for the restart interval; `false` if cancelled first
    async fn wait_restart(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.policy.restart_interval) => true,
            _ = cancel.cancelled() => false,
        }
    }

    async fn run_instance(
        self: Arc<Self>,
        source: String,
        job: Job,
        cancel: CancellationToken,
        state: Arc<Mutex<RunnerState>>,
    ) {
        let singleton = job
            .settings
            .is_singleton()
            .then(|| self.locks.get_lock(&singleton_lock_name(&job.name)));

        while !cancel.is_cancelled() {
            let guard = match &singleton {
                Some(lock) => match acquire_guard(lock, &source, Duration::ZERO).await {
                    Ok(Some(guard)) => Some(guard),
                    Ok(None) => {
                        debug!("Singleton job {} is running elsewhere", job.name);
                        self.set_status(&job, &source, &state, ContinuousStatus::PendingRestart);
                        if self.wait_restart(&cancel).await {
                            continue;
                        }
                        break;
                    }
                    Err(e) => {
                        warn!("Failed to take singleton lock of {}: {}", job.name, e);
                        if self.wait_restart(&cancel).await {
                            continue;
                        }
                        break;
                    }
                },
                None => None,
            };
            let renewal = guard
                .as_ref()
                .map(|guard| guard.spawn_renewal(self.policy.lock_renew_interval));

            self.set_status(&job, &source, &state, ContinuousStatus::Starting);
            let result = self.run_once(&source, &job, &cancel, &state).await;

            if let Some(renewal) = renewal {
                renewal.abort();
            }
            drop(guard);

            match result {
                Ok(ExitOutcome::Cancelled) => break,
                Ok(outcome) => info!(
                    "Continuous job {} exited ({:?}), restarting in {:?}",
                    job.name, outcome, self.policy.restart_interval
                ),
                Err(e) => error!("Failed to run continuous job {}: {}", job.name, e),
            }

            self.set_status(&job, &source, &state, ContinuousStatus::PendingRestart);
            if !self.wait_restart(&cancel).await {
                break;
            }
        }

        self.set_status(&job, &source, &state, ContinuousStatus::Stopped);
        debug!("Runner for {} from {} stopped", job.name, source);
    }

    async fn run_once(
        &self,
        source: &str,
        job: &Job,
        cancel: &CancellationToken,
        state: &Mutex<RunnerState>,
    ) -> Result<ExitOutcome> {
        let command = prepare_command(
            self.fs.as_ref(),
            job,
            &self.temp_path.join(source).join(&job.name),
            None,
        )?;
        let data_dir = self.data_path.join(&job.name);
        let shutdown_file = data_dir.join(format!("shutdown.{}", source));
        let mut env = job_environment(job, &data_dir, None, None, &shutdown_file);

        let port = if job.settings.expose_http() {
            let port = allocate_port()?;
            env.push(("WEBJOBS_PORT".to_string(), port.to_string()));
            Some(port)
        } else {
            None
        };
        state.lock().unwrap_or_else(PoisonError::into_inner).port = port;
        self.set_status(job, source, state, ContinuousStatus::Running);

        let request = ExecutionRequest {
            job_name: job.name.clone(),
            kind: JobKind::Continuous,
            program: command.program,
            args: command.args,
            working_dir: command.working_dir,
            env,
            shutdown_file,
            stopping_wait: job
                .settings
                .stopping_wait_time(self.policy.default_stopping_wait),
            idle_timeout: None,
            timeout: None,
            cancel: cancel.clone(),
        };
        let sink: Arc<dyn OutputSink> =
            Arc::new(ContinuousLog::new(Arc::clone(&self.fs), &data_dir, source));

        let outcome = self.executor.execute(request, sink).await;
        state.lock().unwrap_or_else(PoisonError::into_inner).port = None;
        Ok(outcome?)
    }
}
