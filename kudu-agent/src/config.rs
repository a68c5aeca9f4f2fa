//! Agent configuration
//!
//! Defines all configurable parameters for the coordinator: site paths,
//! polling intervals, lock behaviour, run history and process supervision
//! policy, and web hook delivery.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::environment::Environment;

/// Which lock implementation backs named operation locks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBackend {
    /// Probe OS advisory locks on the locks directory, fall back to leases
    Auto,
    /// OS advisory lock held on an open handle
    Os,
    /// Marker file created exclusively, reclaimable once stale
    Lease,
}

impl FromStr for LockBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(LockBackend::Auto),
            "os" => Ok(LockBackend::Os),
            "lease" => Ok(LockBackend::Lease),
            other => Err(format!("unknown lock backend '{}'", other)),
        }
    }
}

/// Agent configuration
///
/// Timeouts and intervals are configurable so tests and slow shared file
/// systems can tune them independently.
#[derive(Debug, Clone)]
pub struct Config {
    /// Site root; jobs, data, locks and temp directories live below it
    pub root_path: PathBuf,

    /// Additional read-only jobs tree (`{path}/{kind}/{name}`), e.g. from a package
    pub secondary_jobs_path: Option<PathBuf>,

    /// The primary tree is deployed from a read-only package; route writes
    /// to the secondary tree
    pub run_from_package: bool,

    /// Public base URL of the site, used to build job URLs
    pub app_base_url: Option<String>,

    /// Scheduler tick interval
    pub scheduler_interval: Duration,

    /// How often job trees are scanned for changes
    pub watch_interval: Duration,

    /// Quiet period before a burst of file changes is reported
    pub change_debounce: Duration,

    pub lock_backend: LockBackend,

    /// Age after which an unrenewed lease marker may be reclaimed
    pub lock_stale_after: Duration,

    /// Timeout for acquiring shared-state locks (hooks file)
    pub lock_timeout: Duration,

    /// Timeout for acquiring a triggered job's run lock
    pub run_lock_timeout: Duration,

    /// Triggered runs kept per job
    pub job_history_size: usize,

    /// A triggered run with no output for this long is killed
    pub idle_timeout: Duration,

    /// Wait between restarts of an exited continuous job
    pub restart_interval: Duration,

    /// Grace period before a forced kill, unless the job sets `stopping_wait_time`
    pub default_stopping_wait: Duration,

    pub hook_publish_timeout: Duration,

    /// Extra delivery attempts after a retryable failure
    pub hook_publish_retries: u32,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            secondary_jobs_path: None,
            run_from_package: false,
            app_base_url: None,
            scheduler_interval: Duration::from_secs(5),
            watch_interval: Duration::from_secs(2),
            change_debounce: Duration::from_secs(5),
            lock_backend: LockBackend::Auto,
            lock_stale_after: Duration::from_secs(300),
            lock_timeout: Duration::from_secs(30),
            run_lock_timeout: Duration::from_secs(1),
            job_history_size: 50,
            idle_timeout: Duration::from_secs(120),
            restart_interval: Duration::from_secs(60),
            default_stopping_wait: Duration::from_secs(5),
            hook_publish_timeout: Duration::from_secs(10),
            hook_publish_retries: 2,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - KUDU_ROOT (required)
    /// - KUDU_SECONDARY_JOBS_PATH (optional)
    /// - KUDU_RUN_FROM_PACKAGE (optional, true/false, default: false)
    /// - KUDU_APP_BASE_URL (optional)
    /// - KUDU_SCHEDULER_INTERVAL (optional, seconds, default: 5)
    /// - KUDU_WATCH_INTERVAL (optional, seconds, default: 2)
    /// - KUDU_CHANGE_DEBOUNCE (optional, seconds, default: 5)
    /// - KUDU_LOCK_BACKEND (optional, auto/os/lease, default: auto)
    /// - KUDU_LOCK_STALE_AFTER (optional, seconds, default: 300)
    /// - KUDU_LOCK_TIMEOUT (optional, seconds, default: 30)
    /// - KUDU_RUN_LOCK_TIMEOUT (optional, seconds, default: 1)
    /// - KUDU_JOB_HISTORY_SIZE (optional, default: 50)
    /// - KUDU_IDLE_TIMEOUT (optional, seconds, default: 120)
    /// - KUDU_RESTART_INTERVAL (optional, seconds, default: 60)
    /// - KUDU_STOPPING_WAIT (optional, seconds, default: 5)
    /// - KUDU_HOOK_TIMEOUT (optional, seconds, default: 10)
    /// - KUDU_HOOK_RETRIES (optional, default: 2)
    pub fn from_env() -> anyhow::Result<Self> {
        let root_path = std::env::var("KUDU_ROOT")
            .map_err(|_| anyhow::anyhow!("KUDU_ROOT environment variable not set"))?;

        let defaults = Self::new(root_path);

        let lock_backend = match std::env::var("KUDU_LOCK_BACKEND") {
            Ok(value) => value.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            Err(_) => defaults.lock_backend,
        };

        Ok(Self {
            secondary_jobs_path: std::env::var("KUDU_SECONDARY_JOBS_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            run_from_package: env_parse("KUDU_RUN_FROM_PACKAGE").unwrap_or(false),
            app_base_url: std::env::var("KUDU_APP_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            scheduler_interval: env_secs("KUDU_SCHEDULER_INTERVAL")
                .unwrap_or(defaults.scheduler_interval),
            watch_interval: env_secs("KUDU_WATCH_INTERVAL").unwrap_or(defaults.watch_interval),
            change_debounce: env_secs("KUDU_CHANGE_DEBOUNCE").unwrap_or(defaults.change_debounce),
            lock_backend,
            lock_stale_after: env_secs("KUDU_LOCK_STALE_AFTER")
                .unwrap_or(defaults.lock_stale_after),
            lock_timeout: env_secs("KUDU_LOCK_TIMEOUT").unwrap_or(defaults.lock_timeout),
            run_lock_timeout: env_secs("KUDU_RUN_LOCK_TIMEOUT")
                .unwrap_or(defaults.run_lock_timeout),
            job_history_size: env_parse("KUDU_JOB_HISTORY_SIZE")
                .unwrap_or(defaults.job_history_size),
            idle_timeout: env_secs("KUDU_IDLE_TIMEOUT").unwrap_or(defaults.idle_timeout),
            restart_interval: env_secs("KUDU_RESTART_INTERVAL")
                .unwrap_or(defaults.restart_interval),
            default_stopping_wait: env_secs("KUDU_STOPPING_WAIT")
                .unwrap_or(defaults.default_stopping_wait),
            hook_publish_timeout: env_secs("KUDU_HOOK_TIMEOUT")
                .unwrap_or(defaults.hook_publish_timeout),
            hook_publish_retries: env_parse("KUDU_HOOK_RETRIES")
                .unwrap_or(defaults.hook_publish_retries),
            ..defaults
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.root_path.as_os_str().is_empty() {
            anyhow::bail!("root_path cannot be empty");
        }

        if self.run_from_package && self.secondary_jobs_path.is_none() {
            anyhow::bail!("run_from_package requires secondary_jobs_path");
        }

        if let Some(url) = &self.app_base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("app_base_url must start with http:// or https://");
            }
        }

        if self.scheduler_interval.is_zero() {
            anyhow::bail!("scheduler_interval must be greater than 0");
        }

        if self.watch_interval.is_zero() {
            anyhow::bail!("watch_interval must be greater than 0");
        }

        if self.job_history_size == 0 {
            anyhow::bail!("job_history_size must be greater than 0");
        }

        if self.lock_stale_after <= self.lock_timeout {
            anyhow::bail!("lock_stale_after must be longer than lock_timeout");
        }

        Ok(())
    }

    /// Resolved directory layout for this configuration
    pub fn environment(&self) -> Environment {
        let env = Environment::new(&self.root_path);
        match &self.secondary_jobs_path {
            Some(path) => env.with_secondary_jobs_path(path),
            None => env,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new("site")
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}
