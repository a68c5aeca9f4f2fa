//! Primary and secondary job sources behind one interface
//!
//! Reads merge both sources, primary first. Writes go to the writable
//! source: the secondary tree when the site runs from a read-only package,
//! the primary tree otherwise. Operations on an existing job go to the
//! source that holds it.

use kudu_core::domain::job::{Job, JobKind};
use kudu_core::domain::settings::JobSettings;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::manager::{ChangeCallback, JobChange, JobsManager, ObserverToken};
use crate::error::{CoordinatorError, Result};

#[derive(Debug)]
pub struct AggregateJobsManager {
    kind: JobKind,
    sources: Vec<Arc<JobsManager>>,
    writable: usize,
}

impl AggregateJobsManager {
    pub fn new(
        primary: Arc<JobsManager>,
        secondary: Option<Arc<JobsManager>>,
        run_from_package: bool,
    ) -> Self {
        let kind = primary.kind();
        let writable = if run_from_package && secondary.is_some() {
            1
        } else {
            0
        };
        let mut sources = vec![primary];
        sources.extend(secondary);
        Self {
            kind,
            sources,
            writable,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn sources(&self) -> &[Arc<JobsManager>] {
        &self.sources
    }

    /// Source receiving uploads and external syncs
    pub fn writable(&self) -> &Arc<JobsManager> {
        &self.sources[self.writable]
    }

    /// Jobs of every source; a name in the primary hides the same name elsewhere
    pub fn list_jobs(&self, force_refresh: bool) -> Result<Vec<Job>> {
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();
        for source in &self.sources {
            for job in source.list_jobs(force_refresh)? {
                if seen.insert(job.name.to_ascii_lowercase()) {
                    jobs.push(job);
                }
            }
        }
        jobs.sort_by(|a, b| a.name.to_ascii_lowercase().cmp(&b.name.to_ascii_lowercase()));
        Ok(jobs)
    }

    pub fn get_job(&self, name: &str) -> Result<Option<Job>> {
        for source in &self.sources {
            if let Some(job) = source.get_job(name)? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    pub fn has_job(&self, name: &str) -> Result<bool> {
        Ok(self.get_job(name)?.is_some())
    }

    /// Source holding `name`
    pub fn job_source(&self, name: &str) -> Result<Option<&Arc<JobsManager>>> {
        for source in &self.sources {
            if source.has_job(name)? {
                return Ok(Some(source));
            }
        }
        Ok(None)
    }

    fn require_source(&self, name: &str) -> Result<&Arc<JobsManager>> {
        self.job_source(name)?
            .ok_or_else(|| CoordinatorError::JobNotFound(name.to_string()))
    }

    pub fn create_or_replace_job_from_zip(&self, name: &str, archive: &[u8]) -> Result<Job> {
        self.writable().create_or_replace_job_from_zip(name, archive)
    }

    pub fn create_or_replace_job_from_file(
        &self,
        name: &str,
        file_name: &str,
        contents: &[u8],
    ) -> Result<Job> {
        self.writable()
            .create_or_replace_job_from_file(name, file_name, contents)
    }

    /// Delete `name` from every source that has it
    pub fn delete_job(&self, name: &str) -> Result<()> {
        let mut deleted = false;
        for source in &self.sources {
            if source.has_job(name)? {
                source.delete_job(name)?;
                deleted = true;
            }
        }
        if !deleted {
            return Err(CoordinatorError::JobNotFound(name.to_string()));
        }
        Ok(())
    }

    pub fn get_job_settings(&self, name: &str) -> Result<JobSettings> {
        self.require_source(name)?.get_job_settings(name)
    }

    pub fn set_job_settings(&self, name: &str, settings: &JobSettings) -> Result<()> {
        self.require_source(name)?.set_job_settings(name, settings)
    }

    /// Remove data of jobs no source has any more
    pub fn cleanup_deleted_jobs(&self) -> Result<Vec<String>> {
        let known: HashSet<String> = self
            .sources
            .iter()
            .map(|source| source.list_jobs(true))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .map(|job| job.name.to_ascii_lowercase())
            .collect();

        let mut removed = Vec::new();
        for source in &self.sources {
            removed.extend(source.remove_orphaned_data(&known)?);
        }
        if !removed.is_empty() {
            info!("Cleaned up data of {} deleted {} job(s)", removed.len(), self.kind);
        }
        Ok(removed)
    }

    pub fn sync_external_jobs(&self, source_path: &Path, source_name: &str) -> Result<()> {
        self.writable().sync_external_jobs(source_path, source_name)
    }

    pub fn cleanup_external_jobs(&self, source_name: &str) -> Result<()> {
        self.writable().cleanup_external_jobs(source_name)
    }

    /// Observe changes in every source
    pub fn register_change_observer<F>(&self, callback: F) -> Vec<ObserverToken>
    where
        F: Fn(&JobChange) + Send + Sync + 'static,
    {
        let callback: ChangeCallback = Arc::new(callback);
        self.sources
            .iter()
            .map(|source| {
                let callback = Arc::clone(&callback);
                source.register_change_observer(move |change| callback(change))
            })
            .collect()
    }

    pub fn invalidate_cache(&self) {
        for source in &self.sources {
            source.invalidate_cache();
        }
    }
}
