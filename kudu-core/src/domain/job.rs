//! Job domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::domain::run::TriggeredJobRun;
use crate::domain::settings::JobSettings;

/// Marker file that keeps a continuous job stopped
pub const DISABLE_FILE_NAME: &str = "disable.job";

/// Template file (in the job data directory) used to build the extra-info URL
pub const EXTRA_INFO_URL_TEMPLATE_FILE_NAME: &str = "job.extra_info_url.template";

/// Longest accepted job name
pub const MAX_JOB_NAME_LEN: usize = 128;

/// Kind of WebJob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Continuous,
    Triggered,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Continuous => "continuous",
            JobKind::Triggered => "triggered",
        }
    }

    pub fn all() -> [JobKind; 2] {
        [JobKind::Continuous, JobKind::Triggered]
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continuous" => Ok(JobKind::Continuous),
            "triggered" => Ok(JobKind::Triggered),
            other => Err(format!("unknown job kind '{}'", other)),
        }
    }
}

/// Status of a continuous job instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContinuousStatus {
    Initializing,
    Starting,
    Running,
    PendingRestart,
    Stopped,
    Disabled,
}

impl fmt::Display for ContinuousStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContinuousStatus::Initializing => "Initializing",
            ContinuousStatus::Starting => "Starting",
            ContinuousStatus::Running => "Running",
            ContinuousStatus::PendingRestart => "PendingRestart",
            ContinuousStatus::Stopped => "Stopped",
            ContinuousStatus::Disabled => "Disabled",
        };
        f.write_str(s)
    }
}

/// Persisted status of a continuous job (`{data}/jobs/continuous/{name}/status`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuousJobState {
    pub status: ContinuousStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Kind-specific job state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobDetail {
    Continuous {
        status: ContinuousStatus,
        log_url: Option<String>,
    },
    Triggered {
        latest_run: Option<TriggeredJobRun>,
        history_url: Option<String>,
    },
}

impl JobDetail {
    /// Detail with no runtime information yet
    pub fn empty(kind: JobKind) -> Self {
        match kind {
            JobKind::Continuous => JobDetail::Continuous {
                status: ContinuousStatus::Stopped,
                log_url: None,
            },
            JobKind::Triggered => JobDetail::Triggered {
                latest_run: None,
                history_url: None,
            },
        }
    }
}

/// WebJob definition
///
/// Built by scanning `jobs/{kind}/{name}`; runtime fields (status, latest run)
/// are filled in by the kind-specific manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub name: String,
    pub kind: JobKind,
    /// Script path relative to the job directory
    pub run_command: Option<String>,
    pub script_file_path: Option<PathBuf>,
    pub script_host: Option<String>,
    pub url: Option<String>,
    pub extra_info_url: Option<String>,
    /// Set when the job directory has no runnable script
    pub error: Option<String>,
    pub settings: JobSettings,
    /// External source the job was synced from
    pub source: Option<String>,
    pub detail: JobDetail,
}

impl Job {
    pub fn is_runnable(&self) -> bool {
        self.error.is_none() && self.script_file_path.is_some()
    }

    pub fn latest_run(&self) -> Option<&TriggeredJobRun> {
        match &self.detail {
            JobDetail::Triggered { latest_run, .. } => latest_run.as_ref(),
            JobDetail::Continuous { .. } => None,
        }
    }

    pub fn continuous_status(&self) -> Option<ContinuousStatus> {
        match &self.detail {
            JobDetail::Continuous { status, .. } => Some(*status),
            JobDetail::Triggered { .. } => None,
        }
    }
}

/// Check a job name before it is used as a directory name
///
/// Names are compared case-insensitively elsewhere, so only the character set
/// and length are enforced here.
pub fn validate_job_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("job name cannot be empty".to_string());
    }
    if name.len() > MAX_JOB_NAME_LEN {
        return Err(format!(
            "job name cannot be longer than {} characters",
            MAX_JOB_NAME_LEN
        ));
    }
    if name.starts_with('.') {
        return Err(format!("job name '{}' cannot start with '.'", name));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(format!("job name '{}' contains invalid character '{}'", name, c));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_kind_parse() {
        assert_eq!("Triggered".parse::<JobKind>().unwrap(), JobKind::Triggered);
        assert_eq!("continuous".parse::<JobKind>().unwrap(), JobKind::Continuous);
        assert!("nightly".parse::<JobKind>().is_err());
        assert_eq!(JobKind::Continuous.to_string(), "continuous");
    }

    #[test]
    fn test_validate_job_name() {
        assert!(validate_job_name("backup-db_1.0").is_ok());
        assert!(validate_job_name("").is_err());
        assert!(validate_job_name(".hidden").is_err());
        assert!(validate_job_name("../escape").is_err());
        assert!(validate_job_name("a b").is_err());
        assert!(validate_job_name(&"x".repeat(MAX_JOB_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_job_detail_serde_tag() {
        let detail = JobDetail::empty(JobKind::Continuous);
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["type"], "continuous");
        assert_eq!(json["status"], "Stopped");
    }
}
