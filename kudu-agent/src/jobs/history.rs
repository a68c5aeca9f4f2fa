//! Triggered run history
//!
//! Each run lives in `{data}/jobs/triggered/{name}/{run_id}/` with a JSON
//! `status` file and the output and error logs. Run ids sort
//! chronologically, so the newest run is the last directory by name.

use chrono::{DateTime, Utc};
use kudu_core::domain::run::{
    ERROR_LOG_FILE_NAME, OUTPUT_LOG_FILE_NAME, RunStatus, STATUS_FILE_NAME, TriggeredJobStatus,
    new_run_id,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::error::{CoordinatorError, Result};
use crate::fs::{FileSystem, read_optional};
use crate::service::OutputSink;

#[derive(Debug, Clone)]
pub struct RunHistory {
    fs: Arc<dyn FileSystem>,
    data_path: PathBuf,
}

impl RunHistory {
    pub fn new(fs: Arc<dyn FileSystem>, data_path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            data_path: data_path.into(),
        }
    }

    pub fn job_dir(&self, name: &str) -> PathBuf {
        self.data_path.join(name)
    }

    pub fn run_dir(&self, name: &str, run_id: &str) -> PathBuf {
        self.job_dir(name).join(run_id)
    }

    fn run_ids(&self, name: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .fs
            .list_dirs(&self.job_dir(name))?
            .into_iter()
            .filter_map(|dir| dir.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .filter(|id| !id.starts_with('.'))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Runs of `name`, newest first; runs without a readable status are skipped
    pub fn runs(&self, name: &str) -> Result<Vec<(String, TriggeredJobStatus)>> {
        let mut runs = Vec::new();
        for id in self.run_ids(name)?.into_iter().rev() {
            match self.run(name, &id) {
                Ok(Some(status)) => runs.push((id, status)),
                Ok(None) => debug!("Run {} of {} has no status yet", id, name),
                Err(e) => warn!("Skipping run {} of {}: {}", id, name, e),
            }
        }
        Ok(runs)
    }

    pub fn run(&self, name: &str, run_id: &str) -> Result<Option<TriggeredJobStatus>> {
        let path = self.run_dir(name, run_id).join(STATUS_FILE_NAME);
        match read_optional(self.fs.as_ref(), &path)? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Remove all but the newest `keep` runs
    pub fn prune(&self, name: &str, keep: usize) -> Result<usize> {
        let ids = self.run_ids(name)?;
        let excess = ids.len().saturating_sub(keep);
        for id in &ids[..excess] {
            debug!("Removing run {} of {}", id, name);
            self.fs.remove_dir_all_if_exists(&self.run_dir(name, id))?;
        }
        Ok(excess)
    }

    /// Create the directory and `Pending` status of a new run
    ///
    /// Older runs are pruned first so at most `history_size` runs exist once
    /// this one is recorded.
    pub fn start_run(
        &self,
        name: &str,
        trigger: Option<String>,
        now: DateTime<Utc>,
        history_size: usize,
    ) -> Result<RunLogger> {
        self.prune(name, history_size.saturating_sub(1))?;

        let mut at = now;
        let mut id = new_run_id(at);
        while self.fs.exists(&self.run_dir(name, &id)) {
            at += chrono::Duration::microseconds(1);
            id = new_run_id(at);
        }

        let logger = RunLogger {
            fs: Arc::clone(&self.fs),
            dir: self.run_dir(name, &id),
            id,
            status: Mutex::new(TriggeredJobStatus::new(trigger, now)),
        };
        logger.persist(&logger.status())?;
        Ok(logger)
    }
}

/// Status and log writer for one run
#[derive(Debug)]
pub struct RunLogger {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    id: String,
    status: Mutex<TriggeredJobStatus>,
}

impl RunLogger {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn status(&self) -> TriggeredJobStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn output_path(&self) -> PathBuf {
        self.dir.join(OUTPUT_LOG_FILE_NAME)
    }

    pub fn error_path(&self) -> PathBuf {
        self.dir.join(ERROR_LOG_FILE_NAME)
    }

    fn persist(&self, status: &TriggeredJobStatus) -> Result<()> {
        let data = serde_json::to_vec_pretty(status)?;
        self.fs
            .write_atomic(&self.dir.join(STATUS_FILE_NAME), &data)?;
        Ok(())
    }

    pub fn transition(&self, next: RunStatus, at: DateTime<Utc>) -> Result<()> {
        self.complete(next, None, at)
    }

    /// Move to `next`, recording `exit_code` when given
    pub fn complete(&self, next: RunStatus, exit_code: Option<i32>, at: DateTime<Utc>) -> Result<()> {
        let snapshot = {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            status
                .transition(next, at)
                .map_err(CoordinatorError::Internal)?;
            if exit_code.is_some() {
                status.exit_code = exit_code;
            }
            status.clone()
        };
        self.persist(&snapshot)?;
        self.system(&format!("Status changed to {}", next));
        Ok(())
    }

    /// Agent-authored line in the output log
    pub fn system(&self, message: &str) {
        self.append(&self.output_path(), &format!("SYS INFO {}", message));
    }

    fn append(&self, path: &Path, line: &str) {
        let line = format!("[{}] {}\n", Utc::now().to_rfc3339(), line);
        if let Err(e) = self.fs.append(path, line.as_bytes()) {
            warn!("Failed to write {}: {}", path.display(), e);
        }
    }
}

impl OutputSink for RunLogger {
    fn stdout_line(&self, line: &str) {
        self.append(&self.output_path(), &format!("INFO {}", line));
    }

    fn stderr_line(&self, line: &str) {
        self.append(&self.output_path(), &format!("ERR {}", line));
        self.append(&self.error_path(), line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;
    use chrono::TimeZone;

    fn history() -> (Arc<InMemoryFileSystem>, RunHistory) {
        let fs = Arc::new(InMemoryFileSystem::new());
        let history = RunHistory::new(fs.clone(), "/site/data/jobs/triggered");
        (fs, history)
    }

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, second).unwrap()
    }

    #[test]
    fn test_runs_newest_first() {
        let (_, history) = history();
        for second in [1, 3, 2] {
            history.start_run("report", None, at(second), 10).unwrap();
        }

        let starts: Vec<_> = history
            .runs("report")
            .unwrap()
            .into_iter()
            .map(|(_, status)| status.start_time)
            .collect();
        assert_eq!(starts, vec![at(3), at(2), at(1)]);
    }

    #[test]
    fn test_history_is_bounded() {
        let (_, history) = history();
        for second in 0..8 {
            history.start_run("report", None, at(second), 5).unwrap();
        }

        let runs = history.runs("report").unwrap();
        assert_eq!(runs.len(), 5);
        assert_eq!(runs[0].1.start_time, at(7));
        assert_eq!(runs[4].1.start_time, at(3));
    }

    #[test]
    fn test_same_instant_gets_distinct_ids() {
        let (_, history) = history();
        let a = history.start_run("report", None, at(0), 10).unwrap();
        let b = history.start_run("report", None, at(0), 10).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.id() < b.id());
    }

    #[test]
    fn test_logger_transitions_and_logs() {
        let (fs, history) = history();
        let logger = history
            .start_run("report", Some("Schedule - 0 0 * * * *".into()), at(0), 10)
            .unwrap();

        logger.transition(RunStatus::Running, at(1)).unwrap();
        logger.stdout_line("working");
        logger.stderr_line("warning: low disk");
        logger.complete(RunStatus::Failed, Some(2), at(5)).unwrap();

        let status = history.run("report", logger.id()).unwrap().unwrap();
        assert_eq!(status.status, RunStatus::Failed);
        assert_eq!(status.exit_code, Some(2));
        assert_eq!(status.end_time, Some(at(5)));
        assert_eq!(status.trigger.as_deref(), Some("Schedule - 0 0 * * * *"));

        let output = fs.read_to_string(&logger.output_path()).unwrap();
        assert!(output.contains("SYS INFO Status changed to Running"));
        assert!(output.contains("INFO working"));
        assert!(output.contains("ERR warning: low disk"));
        let errors = fs.read_to_string(&logger.error_path()).unwrap();
        assert!(errors.contains("warning: low disk"));
        assert!(!errors.contains("working"));

        assert!(logger.transition(RunStatus::Running, at(6)).is_err());
    }
}
