//! Jobs manager
//!
//! One implementation for both job kinds. A `JobsManager` owns the
//! `{jobs}/{kind}` tree of one source:
//! - Scans job directories into [`Job`] definitions, cached until a change
//! - Installs uploads through a hidden staging directory and a rename swap,
//!   so a partially written job is never listed
//! - Reads and writes `settings.job`
//! - Mirrors jobs from external sources, tagged by source name
//! - Notifies registered observers of every change

use kudu_core::domain::job::{
    EXTRA_INFO_URL_TEMPLATE_FILE_NAME, Job, JobDetail, JobKind, validate_job_name,
};
use kudu_core::domain::settings::{JobSettings, SETTINGS_FILE_NAME};
use std::collections::HashSet;
use std::fmt;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::{debug, info, instrument, warn};

use crate::error::{CoordinatorError, Result};
use crate::fs::{FileSystem, read_optional};
use crate::jobs::script_host::find_command_to_run;

/// File in a job's data directory naming the external source it came from
pub const SOURCE_FILE_NAME: &str = "job.source";

/// Change notification delivered to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobChange {
    pub kind: JobKind,
    /// Label of the jobs source that changed
    pub source: String,
    /// `None` when the whole tree may have changed
    pub name: Option<String>,
}

pub type ChangeCallback = Arc<dyn Fn(&JobChange) + Send + Sync>;

#[derive(Default)]
struct ObserverRegistry {
    next_id: u64,
    callbacks: Vec<(u64, ChangeCallback)>,
}

/// Registration handle; dropping it (or calling `unsubscribe`) removes the observer
#[must_use = "dropping the token unsubscribes the observer"]
pub struct ObserverToken {
    id: u64,
    registry: Weak<Mutex<ObserverRegistry>>,
}

impl ObserverToken {
    pub fn unsubscribe(self) {}
}

impl fmt::Debug for ObserverToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverToken").field("id", &self.id).finish()
    }
}

impl Drop for ObserverToken {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .callbacks
                .retain(|(id, _)| *id != self.id);
        }
    }
}

pub struct JobsManager {
    kind: JobKind,
    label: String,
    fs: Arc<dyn FileSystem>,
    binaries_path: PathBuf,
    data_path: PathBuf,
    app_base_url: Option<String>,
    cache: RwLock<Option<Vec<Job>>>,
    observers: Arc<Mutex<ObserverRegistry>>,
}

impl fmt::Debug for JobsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobsManager")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("binaries_path", &self.binaries_path)
            .finish()
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_none_or(|n| n.starts_with('.'))
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn validate_name(name: &str) -> Result<()> {
    validate_job_name(name).map_err(CoordinatorError::Validation)
}

fn validate_file_name(file_name: &str) -> Result<()> {
    if file_name.is_empty()
        || file_name == "."
        || file_name == ".."
        || file_name.contains(['/', '\\'])
    {
        return Err(CoordinatorError::Validation(format!(
            "invalid file name '{}'",
            file_name
        )));
    }
    Ok(())
}

fn extract_zip(fs: &dyn FileSystem, archive: &[u8], dest: &Path) -> Result<()> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))?;
    fs.create_dir_all(dest)?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(CoordinatorError::Validation(format!(
                "archive entry '{}' escapes the job directory",
                entry.name()
            )));
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            fs.create_dir_all(&target)?;
            continue;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        fs.write(&target, &data)?;
    }
    Ok(())
}

impl JobsManager {
    pub fn new(
        kind: JobKind,
        label: impl Into<String>,
        fs: Arc<dyn FileSystem>,
        binaries_path: impl Into<PathBuf>,
        data_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kind,
            label: label.into(),
            fs,
            binaries_path: binaries_path.into(),
            data_path: data_path.into(),
            app_base_url: None,
            cache: RwLock::new(None),
            observers: Arc::new(Mutex::new(ObserverRegistry::default())),
        }
    }

    pub fn with_app_base_url(mut self, app_base_url: Option<String>) -> Self {
        self.app_base_url = app_base_url.map(|url| url.trim_end_matches('/').to_string());
        self
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub fn binaries_path(&self) -> &Path {
        &self.binaries_path
    }

    pub fn job_data_path(&self, name: &str) -> PathBuf {
        self.data_path.join(name)
    }

    // =========================================================================
    // Listing
    // =========================================================================

    /// All jobs of this source, sorted by name
    #[instrument(skip(self), fields(kind = %self.kind, source = %self.label))]
    pub fn list_jobs(&self, force_refresh: bool) -> Result<Vec<Job>> {
        if !force_refresh {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(jobs) = cache.as_ref() {
                return Ok(jobs.clone());
            }
        }

        let jobs = self.scan()?;
        debug!("Scanned {} {} job(s)", jobs.len(), self.kind);
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(jobs.clone());
        Ok(jobs)
    }

    /// Case-insensitive lookup
    pub fn get_job(&self, name: &str) -> Result<Option<Job>> {
        Ok(self
            .list_jobs(false)?
            .into_iter()
            .find(|job| job.name.eq_ignore_ascii_case(name)))
    }

    pub fn has_job(&self, name: &str) -> Result<bool> {
        Ok(self.get_job(name)?.is_some())
    }

    /// Directory of `name` as it exists on disk
    pub fn job_path(&self, name: &str) -> Result<PathBuf> {
        self.find_job_dir(name)?
            .ok_or_else(|| CoordinatorError::JobNotFound(name.to_string()))
    }

    pub fn invalidate_cache(&self) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn scan(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for dir in self.fs.list_dirs(&self.binaries_path)? {
            if is_hidden(&dir) {
                continue;
            }
            jobs.push(self.build_job(&dir)?);
        }
        jobs.sort_by(|a, b| a.name.to_ascii_lowercase().cmp(&b.name.to_ascii_lowercase()));
        Ok(jobs)
    }

    fn find_job_dir(&self, name: &str) -> Result<Option<PathBuf>> {
        Ok(self
            .fs
            .list_dirs(&self.binaries_path)?
            .into_iter()
            .filter(|dir| !is_hidden(dir))
            .find(|dir| dir_name(dir).eq_ignore_ascii_case(name)))
    }

    fn build_job(&self, dir: &Path) -> Result<Job> {
        let name = dir_name(dir);
        let files = self.fs.list_files(dir)?;

        let (script_file_path, script_host, run_command, error) = match find_command_to_run(&files)
        {
            Some((path, host)) => {
                let relative = path
                    .strip_prefix(dir)
                    .map(|p| p.to_string_lossy().into_owned())
                    .ok();
                (Some(path), Some(host.name.to_string()), relative, None)
            }
            None => (
                None,
                None,
                None,
                Some(format!("no runnable script found in job '{}'", name)),
            ),
        };

        let url = self
            .app_base_url
            .as_ref()
            .map(|base| format!("{}/api/{}webjobs/{}", base, self.kind, name));
        let detail = match JobDetail::empty(self.kind) {
            JobDetail::Continuous { status, .. } => JobDetail::Continuous {
                status,
                log_url: url.as_ref().map(|u| format!("{}/log", u)),
            },
            JobDetail::Triggered { latest_run, .. } => JobDetail::Triggered {
                latest_run,
                history_url: url.as_ref().map(|u| format!("{}/history", u)),
            },
        };

        Ok(Job {
            extra_info_url: self.extra_info_url(&name),
            source: self.read_source_tag(&name),
            settings: self.read_settings(dir),
            name,
            kind: self.kind,
            run_command,
            script_file_path,
            script_host,
            url,
            error,
            detail,
        })
    }

    fn read_settings(&self, dir: &Path) -> JobSettings {
        let path = dir.join(SETTINGS_FILE_NAME);
        match read_optional(self.fs.as_ref(), &path) {
            Ok(Some(data)) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                warn!("Ignoring malformed {}: {}", path.display(), e);
                JobSettings::default()
            }),
            Ok(None) => JobSettings::default(),
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                JobSettings::default()
            }
        }
    }

    fn read_source_tag(&self, name: &str) -> Option<String> {
        let path = self.job_data_path(name).join(SOURCE_FILE_NAME);
        self.fs
            .read_to_string(&path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Template in the job data directory, else the dashboard link
    fn extra_info_url(&self, name: &str) -> Option<String> {
        let template_path = self
            .job_data_path(name)
            .join(EXTRA_INFO_URL_TEMPLATE_FILE_NAME);

        if let Ok(template) = self.fs.read_to_string(&template_path) {
            let url = template
                .trim()
                .replace("{jobName}", name)
                .replace("{jobType}", self.kind.as_str());
            if url.starts_with("http://") || url.starts_with("https://") {
                return Some(url);
            }
            if let Some(base) = &self.app_base_url {
                return Some(format!("{}/{}", base, url.trim_start_matches('/')));
            }
            return Some(url);
        }

        self.app_base_url
            .as_ref()
            .map(|base| format!("{}/azurejobs/#/jobs/{}/{}", base, self.kind, name))
    }

    // =========================================================================
    // Uploads and deletion
    // =========================================================================

    /// Replace (or create) `name` with the contents of a zip archive
    #[instrument(skip(self, archive), fields(kind = %self.kind, size = archive.len()))]
    pub fn create_or_replace_job_from_zip(&self, name: &str, archive: &[u8]) -> Result<Job> {
        validate_name(name)?;
        self.install(name, |staging| extract_zip(self.fs.as_ref(), archive, staging))
    }

    /// Replace (or create) `name` with a single script file
    #[instrument(skip(self, contents), fields(kind = %self.kind, size = contents.len()))]
    pub fn create_or_replace_job_from_file(
        &self,
        name: &str,
        file_name: &str,
        contents: &[u8],
    ) -> Result<Job> {
        validate_name(name)?;
        validate_file_name(file_name)?;
        self.install(name, |staging| {
            self.fs.write(&staging.join(file_name), contents)?;
            Ok(())
        })
    }

    fn install<F>(&self, name: &str, populate: F) -> Result<Job>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        let staging = self
            .binaries_path
            .join(format!(".staging-{}", uuid::Uuid::new_v4()));
        self.fs.create_dir_all(&staging)?;

        let result = populate(&staging).and_then(|()| self.swap_in(name, &staging));
        if let Err(e) = result {
            if let Err(cleanup) = self.fs.remove_dir_all_if_exists(&staging) {
                warn!("Failed to remove staging directory: {}", cleanup);
            }
            return Err(e);
        }

        info!("Installed {} job {}", self.kind, name);
        self.notify_change(Some(name));
        self.build_job(&self.binaries_path.join(name))
    }

    fn swap_in(&self, name: &str, staging: &Path) -> Result<()> {
        let target = self.binaries_path.join(name);
        let existing = self.find_job_dir(name)?;

        let retired = match &existing {
            Some(dir) => {
                let retired = self
                    .binaries_path
                    .join(format!(".retired-{}", uuid::Uuid::new_v4()));
                self.fs.rename(dir, &retired)?;
                Some((dir.clone(), retired))
            }
            None => None,
        };

        if let Err(e) = self.fs.rename(staging, &target) {
            if let Some((original, retired)) = &retired {
                if let Err(restore) = self.fs.rename(retired, original) {
                    warn!("Failed to restore {}: {}", original.display(), restore);
                }
            }
            return Err(e.into());
        }

        if let Some((_, retired)) = retired {
            if let Err(e) = self.fs.remove_dir_all(&retired) {
                warn!("Failed to remove replaced job directory: {}", e);
            }
        }
        Ok(())
    }

    /// Remove the job's binaries and data directories
    #[instrument(skip(self), fields(kind = %self.kind, source = %self.label))]
    pub fn delete_job(&self, name: &str) -> Result<()> {
        let dir = self.job_path(name)?;
        self.remove_job_dirs(&dir)?;
        info!("Deleted {} job {}", self.kind, name);
        self.notify_change(Some(name));
        Ok(())
    }

    fn remove_job_dirs(&self, dir: &Path) -> Result<()> {
        let actual = dir_name(dir);
        self.fs.remove_dir_all(dir)?;
        self.fs
            .remove_dir_all_if_exists(&self.job_data_path(&actual))?;
        Ok(())
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub fn get_job_settings(&self, name: &str) -> Result<JobSettings> {
        let dir = self.job_path(name)?;
        Ok(self.read_settings(&dir))
    }

    /// Persist `settings` atomically; last writer wins
    #[instrument(skip(self, settings), fields(kind = %self.kind))]
    pub fn set_job_settings(&self, name: &str, settings: &JobSettings) -> Result<()> {
        let dir = self.job_path(name)?;
        let data = serde_json::to_vec_pretty(settings)?;
        self.fs.write_atomic(&dir.join(SETTINGS_FILE_NAME), &data)?;
        self.notify_change(Some(&dir_name(&dir)));
        Ok(())
    }

    // =========================================================================
    // Cleanup and external sources
    // =========================================================================

    /// Refresh the cache and drop data directories of jobs deleted out of band
    #[instrument(skip(self), fields(kind = %self.kind, source = %self.label))]
    pub fn cleanup_deleted_jobs(&self) -> Result<Vec<String>> {
        let known = self
            .list_jobs(true)?
            .into_iter()
            .map(|job| job.name.to_ascii_lowercase())
            .collect();
        self.remove_orphaned_data(&known)
    }

    /// Remove data directories whose lowercase name is not in `known`
    pub(crate) fn remove_orphaned_data(&self, known: &HashSet<String>) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for dir in self.fs.list_dirs(&self.data_path)? {
            if is_hidden(&dir) {
                continue;
            }
            let name = dir_name(&dir);
            if !known.contains(&name.to_ascii_lowercase()) {
                info!("Removing data of deleted {} job {}", self.kind, name);
                self.fs.remove_dir_all(&dir)?;
                removed.push(name);
            }
        }
        Ok(removed)
    }

    /// Mirror `{source_path}/jobs/{kind}/*` into this tree, tagged `source_name`
    ///
    /// Jobs previously synced from the same source that it no longer has are
    /// removed. Jobs not owned by the source are never overwritten.
    #[instrument(skip(self, source_path), fields(kind = %self.kind))]
    pub fn sync_external_jobs(&self, source_path: &Path, source_name: &str) -> Result<()> {
        let source_dir = source_path.join("jobs").join(self.kind.as_str());
        let current = self.list_jobs(true)?;
        let mut seen = HashSet::new();

        for dir in self.fs.list_dirs(&source_dir)? {
            if is_hidden(&dir) {
                continue;
            }
            let name = dir_name(&dir);
            if let Err(e) = validate_job_name(&name) {
                warn!("Skipping external job: {}", e);
                continue;
            }
            seen.insert(name.to_ascii_lowercase());

            let owner = current
                .iter()
                .find(|job| job.name.eq_ignore_ascii_case(&name))
                .map(|job| job.source.as_deref());
            if let Some(owner) = owner {
                if owner != Some(source_name) {
                    warn!(
                        "Job {} already exists and is not owned by source {}, skipping",
                        name, source_name
                    );
                    continue;
                }
            }

            let staging = self
                .binaries_path
                .join(format!(".staging-{}", uuid::Uuid::new_v4()));
            let result = self
                .fs
                .copy_dir_all(&dir, &staging)
                .map_err(CoordinatorError::from)
                .and_then(|()| self.swap_in(&name, &staging));
            if let Err(e) = result {
                let _ = self.fs.remove_dir_all_if_exists(&staging);
                return Err(e);
            }
            self.fs.write(
                &self.job_data_path(&name).join(SOURCE_FILE_NAME),
                source_name.as_bytes(),
            )?;
            debug!("Synced job {} from {}", name, source_name);
        }

        for job in &current {
            if job.source.as_deref() == Some(source_name)
                && !seen.contains(&job.name.to_ascii_lowercase())
            {
                info!("Removing job {} dropped by source {}", job.name, source_name);
                self.remove_job_dirs(&self.binaries_path.join(&job.name))?;
            }
        }

        self.notify_change(None);
        Ok(())
    }

    /// Remove every job synced from `source_name`
    #[instrument(skip(self), fields(kind = %self.kind))]
    pub fn cleanup_external_jobs(&self, source_name: &str) -> Result<()> {
        for job in self.list_jobs(true)? {
            if job.source.as_deref() == Some(source_name) {
                info!("Removing job {} of removed source {}", job.name, source_name);
                self.remove_job_dirs(&self.binaries_path.join(&job.name))?;
            }
        }
        self.notify_change(None);
        Ok(())
    }

    // =========================================================================
    // Change notification
    // =========================================================================

    pub fn register_change_observer<F>(&self, callback: F) -> ObserverToken
    where
        F: Fn(&JobChange) + Send + Sync + 'static,
    {
        let mut registry = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.callbacks.push((id, Arc::new(callback)));
        ObserverToken {
            id,
            registry: Arc::downgrade(&self.observers),
        }
    }

    /// Invalidate the cache and tell every observer
    pub fn notify_change(&self, name: Option<&str>) {
        self.invalidate_cache();
        let change = JobChange {
            kind: self.kind,
            source: self.label.clone(),
            name: name.map(str::to_string),
        };
        let callbacks: Vec<ChangeCallback> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(&change);
        }
    }
}
