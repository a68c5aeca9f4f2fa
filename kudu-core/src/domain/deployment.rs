//! Deployment status payload
//!
//! This is the body POSTed to `PostDeployment` web hooks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deployment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentState {
    Pending,
    Building,
    Deploying,
    Failed,
    Success,
}

/// Deployment status record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    pub id: String,
    pub status: DeploymentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployer: Option<String>,
    pub received_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_end_time: Option<DateTime<Utc>>,
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
}

impl DeploymentStatus {
    pub fn new(id: impl Into<String>, status: DeploymentState) -> Self {
        Self {
            id: id.into(),
            status,
            status_text: None,
            author_email: None,
            author: None,
            message: None,
            progress: None,
            deployer: None,
            received_time: Utc::now(),
            start_time: None,
            end_time: None,
            last_success_end_time: None,
            complete: matches!(status, DeploymentState::Failed | DeploymentState::Success),
            site_name: None,
        }
    }
}
