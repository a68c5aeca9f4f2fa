//! Job DTOs

use serde::{Deserialize, Serialize};

use crate::domain::run::TriggeredJobRun;

/// Request to invoke a triggered job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvokeJob {
    /// Passed to the job as `WEBJOBS_COMMAND_ARGUMENTS`
    pub arguments: Option<String>,
    pub trigger: Option<String>,
}

/// Result of a triggered job invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeJobResponse {
    pub job_name: String,
    pub run_id: String,
}

/// Run history of a triggered job, newest first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggeredJobHistory {
    pub runs: Vec<TriggeredJobRun>,
}
