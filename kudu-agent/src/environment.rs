//! Site directory layout
//!
//! ```text
//! {root}/jobs/{kind}/{name}/...        job binaries, settings.job, disable.job
//! {root}/data/jobs/{kind}/{name}/...   status, run history, logs
//! {root}/data/hooks                    web hook registry
//! {root}/locks/{name}.lock             operation locks
//! {root}/temp/jobs/{kind}/{name}/...   working copies of jobs
//! ```

use kudu_core::domain::job::JobKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub root_path: PathBuf,
    pub jobs_path: PathBuf,
    pub jobs_data_path: PathBuf,
    pub locks_path: PathBuf,
    pub hooks_file: PathBuf,
    pub temp_path: PathBuf,
    pub secondary_jobs_path: Option<PathBuf>,
}

impl Environment {
    pub fn new(root_path: impl AsRef<Path>) -> Self {
        let root = root_path.as_ref().to_path_buf();
        Self {
            jobs_path: root.join("jobs"),
            jobs_data_path: root.join("data").join("jobs"),
            locks_path: root.join("locks"),
            hooks_file: root.join("data").join("hooks"),
            temp_path: root.join("temp"),
            secondary_jobs_path: None,
            root_path: root,
        }
    }

    pub fn with_secondary_jobs_path(mut self, path: impl AsRef<Path>) -> Self {
        self.secondary_jobs_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// `{root}/jobs/{kind}`
    pub fn job_binaries_path(&self, kind: JobKind) -> PathBuf {
        self.jobs_path.join(kind.as_str())
    }

    /// `{secondary}/{kind}`, when a secondary tree is configured
    pub fn secondary_job_binaries_path(&self, kind: JobKind) -> Option<PathBuf> {
        self.secondary_jobs_path
            .as_ref()
            .map(|path| path.join(kind.as_str()))
    }

    /// `{root}/data/jobs/{kind}`
    pub fn job_data_path(&self, kind: JobKind) -> PathBuf {
        self.jobs_data_path.join(kind.as_str())
    }

    /// `{root}/temp/jobs/{kind}`
    pub fn job_temp_path(&self, kind: JobKind) -> PathBuf {
        self.temp_path.join("jobs").join(kind.as_str())
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.locks_path.join(format!("{}.lock", name))
    }
}
