//! Triggered job run types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const STATUS_FILE_NAME: &str = "status";
pub const OUTPUT_LOG_FILE_NAME: &str = "output_log.txt";
pub const ERROR_LOG_FILE_NAME: &str = "error_log.txt";

/// Triggered run status
///
/// `Pending -> Running -> {Success | Failed}`. `Aborted` marks a run whose
/// process went away without recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Aborted
        )
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Aborted)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Aborted)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "Pending",
            RunStatus::Running => "Running",
            RunStatus::Success => "Success",
            RunStatus::Failed => "Failed",
            RunStatus::Aborted => "Aborted",
        };
        f.write_str(s)
    }
}

/// Content of a run's `status` file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggeredJobStatus {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl TriggeredJobStatus {
    pub fn new(trigger: Option<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            status: RunStatus::Pending,
            trigger,
            start_time,
            end_time: None,
            exit_code: None,
        }
    }

    /// Move to `next`, stamping the end time on terminal states
    pub fn transition(&mut self, next: RunStatus, at: DateTime<Utc>) -> Result<(), String> {
        if !self.status.can_transition_to(next) {
            return Err(format!(
                "invalid run status transition {} -> {}",
                self.status, next
            ));
        }
        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(at.max(self.start_time));
        }
        Ok(())
    }
}

/// One triggered run as reported to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggeredJobRun {
    pub id: String,
    pub job_name: String,
    pub status: RunStatus,
    pub trigger: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub url: Option<String>,
    pub output_url: Option<String>,
    pub error_url: Option<String>,
}

impl TriggeredJobRun {
    pub fn from_status(id: impl Into<String>, job_name: impl Into<String>, status: TriggeredJobStatus) -> Self {
        Self {
            id: id.into(),
            job_name: job_name.into(),
            status: status.status,
            trigger: status.trigger,
            start_time: status.start_time,
            end_time: status.end_time,
            exit_code: status.exit_code,
            url: None,
            output_url: None,
            error_url: None,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

/// Run id for a run starting at `at`
///
/// Fixed-width UTC timestamp with microseconds, so lexical order is
/// chronological order.
pub fn new_run_id(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S%6f").to_string()
}
