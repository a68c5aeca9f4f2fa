//! Site wiring
//!
//! A [`Site`] owns every manager of one site root. It is built once, by the
//! daemon or the CLI, and the managers are shared from it through `Arc`.

use kudu_client::{HookClient, JobEndpointClient};
use kudu_core::domain::job::JobKind;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::environment::Environment;
use crate::error::Result;
use crate::fs::{FileSystem, OsFileSystem};
use crate::hooks::{HookPublisher, PublishPolicy, WebHooksManager};
use crate::jobs::{
    AggregateContinuousJobsManager, AggregateJobsManager, ContinuousPolicy, JobsManager,
    JobsWatcher, RunHistory, TriggeredJobsManager, TriggeredPolicy,
};
use crate::lock::{FileLockProvider, LockInfo, LockProvider};
use crate::scheduler::TriggeredJobsScheduler;
use crate::service::{JobEndpoint, JobExecutor, ProcessExecutor};

/// Name of the lock guarding the web hook registry
pub const HOOKS_LOCK_NAME: &str = "hooks";

/// Outside collaborators of a site
pub struct Services {
    pub fs: Arc<dyn FileSystem>,
    pub executor: Arc<dyn JobExecutor>,
    pub endpoint: Arc<dyn JobEndpoint>,
    pub publisher: Arc<dyn HookPublisher>,
}

impl Services {
    /// Real disk, real processes and real HTTP
    pub fn standard(config: &Config) -> Result<Self> {
        Ok(Self {
            fs: Arc::new(OsFileSystem::new()),
            executor: Arc::new(ProcessExecutor::new()),
            endpoint: Arc::new(JobEndpointClient::new(config.hook_publish_timeout)?),
            publisher: Arc::new(HookClient::new(config.hook_publish_timeout)?),
        })
    }
}

/// State of one named lock
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub name: String,
    pub held: bool,
    pub holder: Option<LockInfo>,
}

pub struct Site {
    config: Config,
    environment: Environment,
    fs: Arc<dyn FileSystem>,
    locks: Arc<FileLockProvider>,
    triggered: Arc<TriggeredJobsManager>,
    continuous: Arc<AggregateContinuousJobsManager>,
    hooks: Arc<WebHooksManager>,
}

impl Site {
    pub fn open(config: Config) -> Result<Self> {
        let services = Services::standard(&config)?;
        Self::with_services(config, services)
    }

    pub fn with_services(config: Config, services: Services) -> Result<Self> {
        let environment = config.environment();
        let fs = services.fs;

        for kind in JobKind::all() {
            fs.create_dir_all(&environment.job_binaries_path(kind))?;
            fs.create_dir_all(&environment.job_data_path(kind))?;
        }
        fs.create_dir_all(&environment.locks_path)?;

        let locks = Arc::new(FileLockProvider::new(
            environment.locks_path.clone(),
            Arc::clone(&fs),
            config.lock_backend,
            config.lock_stale_after,
        ));
        let lock_provider: Arc<dyn LockProvider> = locks.clone();

        let triggered = Arc::new(TriggeredJobsManager::new(
            Self::jobs_manager(&config, &environment, &fs, JobKind::Triggered),
            RunHistory::new(Arc::clone(&fs), environment.job_data_path(JobKind::Triggered)),
            Arc::clone(&fs),
            Arc::clone(&lock_provider),
            Arc::clone(&services.executor),
            TriggeredPolicy::from_config(&config),
            environment.job_temp_path(JobKind::Triggered),
        ));

        let continuous = Arc::new(AggregateContinuousJobsManager::new(
            Self::jobs_manager(&config, &environment, &fs, JobKind::Continuous),
            Arc::clone(&fs),
            Arc::clone(&lock_provider),
            services.executor,
            services.endpoint,
            ContinuousPolicy::from_config(&config),
            environment.job_data_path(JobKind::Continuous),
            environment.job_temp_path(JobKind::Continuous),
        ));

        let hooks = Arc::new(WebHooksManager::new(
            Arc::clone(&fs),
            environment.hooks_file.clone(),
            lock_provider.get_lock(HOOKS_LOCK_NAME),
            config.lock_timeout,
            services.publisher,
            PublishPolicy::from_config(&config),
        ));

        Ok(Self {
            config,
            environment,
            fs,
            locks,
            triggered,
            continuous,
            hooks,
        })
    }

    fn jobs_manager(
        config: &Config,
        environment: &Environment,
        fs: &Arc<dyn FileSystem>,
        kind: JobKind,
    ) -> Arc<AggregateJobsManager> {
        let source = |label: &str, binaries_path: PathBuf| {
            Arc::new(
                JobsManager::new(
                    kind,
                    label,
                    Arc::clone(fs),
                    binaries_path,
                    environment.job_data_path(kind),
                )
                .with_app_base_url(config.app_base_url.clone()),
            )
        };
        let primary = source("primary", environment.job_binaries_path(kind));
        let secondary = environment
            .secondary_job_binaries_path(kind)
            .map(|path| source("secondary", path));
        Arc::new(AggregateJobsManager::new(
            primary,
            secondary,
            config.run_from_package,
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub fn locks(&self) -> &Arc<FileLockProvider> {
        &self.locks
    }

    pub fn triggered(&self) -> &Arc<TriggeredJobsManager> {
        &self.triggered
    }

    pub fn continuous(&self) -> &Arc<AggregateContinuousJobsManager> {
        &self.continuous
    }

    pub fn hooks(&self) -> &Arc<WebHooksManager> {
        &self.hooks
    }

    /// Jobs of `kind`, across sources
    pub fn jobs(&self, kind: JobKind) -> &Arc<AggregateJobsManager> {
        match kind {
            JobKind::Triggered => self.triggered.jobs(),
            JobKind::Continuous => self.continuous.jobs(),
        }
    }

    /// Every lock that has a file under the locks directory
    pub fn lock_status(&self) -> Vec<LockStatus> {
        let mut names = self.locks.known_lock_names();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let lock = self.locks.get_lock(&name);
                LockStatus {
                    held: lock.is_held(),
                    holder: lock.info(),
                    name,
                }
            })
            .collect()
    }

    /// Watcher over every job tree of the site
    pub fn watcher(&self) -> JobsWatcher {
        let sources = JobKind::all()
            .into_iter()
            .flat_map(|kind| self.jobs(kind).sources().to_vec())
            .collect();
        JobsWatcher::new(
            sources,
            self.config.watch_interval,
            self.config.change_debounce,
        )
    }

    pub fn scheduler(&self) -> TriggeredJobsScheduler {
        TriggeredJobsScheduler::new(Arc::clone(&self.triggered), self.config.scheduler_interval)
    }

    /// Run the watcher, the scheduler and the continuous supervisor until
    /// `shutdown`, then wait for all three to stop
    pub async fn run(&self, shutdown: CancellationToken) {
        for kind in JobKind::all() {
            if let Err(e) = self.jobs(kind).cleanup_deleted_jobs() {
                error!("Failed to clean up deleted {} jobs: {}", kind, e);
            }
        }

        let watcher = tokio::spawn(self.watcher().run(shutdown.clone()));
        let scheduler = tokio::spawn(self.scheduler().run(shutdown.clone()));
        let supervisor = self.continuous.start(shutdown.clone());
        info!("Site {} is running", self.environment.root_path.display());

        for (name, task) in [
            ("watcher", watcher),
            ("scheduler", scheduler),
            ("continuous supervisor", supervisor),
        ] {
            if let Err(e) = task.await {
                error!("The {} task failed: {}", name, e);
            }
        }
        info!("Site {} stopped", self.environment.root_path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockBackend;
    use crate::fs::InMemoryFileSystem;
    use crate::lock::acquire_guard;
    use crate::hooks::publisher_testing::FakePublisher;
    use crate::service::testing::FakeExecutor;
    use kudu_core::domain::hook::{HookEventType, WebHook};
    use kudu_core::domain::run::RunStatus;
    use std::path::Path;
    use std::time::Duration;

    fn site(fs: Arc<InMemoryFileSystem>, secondary: bool) -> Site {
        let mut config = Config::new("/site");
        config.lock_backend = LockBackend::Lease;
        config.app_base_url = Some("https://site.example".to_string());
        if secondary {
            config.secondary_jobs_path = Some("/package".into());
            config.run_from_package = true;
        }
        let services = Services {
            fs,
            executor: Arc::new(FakeExecutor::new(Duration::from_millis(1), 0)),
            endpoint: Arc::new(JobEndpointClient::new(Duration::from_secs(1)).unwrap()),
            publisher: Arc::new(FakePublisher::default()),
        };
        Site::with_services(config, services).unwrap()
    }

    #[test]
    fn test_open_creates_layout() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let site = site(fs.clone(), false);

        for dir in [
            "/site/jobs/triggered",
            "/site/jobs/continuous",
            "/site/data/jobs/triggered",
            "/site/data/jobs/continuous",
            "/site/locks",
        ] {
            assert!(fs.is_dir(Path::new(dir)), "{} missing", dir);
        }
        assert_eq!(site.jobs(JobKind::Triggered).sources().len(), 1);
    }

    #[test]
    fn test_run_from_package_writes_to_secondary() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let site = site(fs.clone(), true);

        site.jobs(JobKind::Continuous)
            .create_or_replace_job_from_file("worker", "run.sh", b"echo hi")
            .unwrap();

        assert!(fs.exists(Path::new("/package/continuous/worker/run.sh")));
        let job = site.continuous().get_job("worker").unwrap().unwrap();
        assert_eq!(
            job.url.as_deref(),
            Some("https://site.example/api/continuouswebjobs/worker")
        );
    }

    #[tokio::test]
    async fn test_invoke_and_lock_status() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let site = site(fs.clone(), false);
        site.jobs(JobKind::Triggered)
            .create_or_replace_job_from_file("report", "run.sh", b"echo report")
            .unwrap();

        let handle = site
            .triggered()
            .invoke_triggered_job("report", None, Some("test".to_string()))
            .await
            .unwrap();
        assert_eq!(handle.wait().await.unwrap(), RunStatus::Success);
        assert_eq!(site.triggered().history("report").unwrap().runs.len(), 1);
        // Released leases leave no marker behind
        assert!(site.lock_status().is_empty());

        let guard = acquire_guard(&site.locks().get_lock("deployment"), "deploy", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let status = site.lock_status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].name, "deployment");
        assert!(status[0].held);
        assert_eq!(status[0].holder.as_ref().unwrap().operation, "deploy");
        drop(guard);
        assert!(site.lock_status().is_empty());
    }

    #[tokio::test]
    async fn test_hooks_are_persisted_under_data() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let site = site(fs.clone(), false);

        site.hooks()
            .add_web_hook(WebHook::new(HookEventType::PostDeployment, "https://x/hook"))
            .await
            .unwrap();

        assert!(fs.exists(Path::new("/site/data/hooks")));
        assert_eq!(site.hooks().web_hooks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let site = site(fs, false);
        let shutdown = CancellationToken::new();

        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        tokio::time::timeout(Duration::from_secs(5), site.run(shutdown))
            .await
            .expect("site stopped");
    }
}
