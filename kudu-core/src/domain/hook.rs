//! Web hook domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::deployment::{DeploymentState, DeploymentStatus};

/// Event a hook subscribes to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookEventType {
    #[default]
    PostDeployment,
}

impl HookEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEventType::PostDeployment => "PostDeployment",
        }
    }
}

impl fmt::Display for HookEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("PostDeployment") {
            Ok(HookEventType::PostDeployment)
        } else {
            Err(format!("unknown hook event type '{}'", s))
        }
    }
}

/// Outcome of the last publish attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishStatus {
    Success,
    Failure,
}

/// Summary of the deployment a hook was last notified about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishContext {
    pub deployment_id: String,
    pub status: DeploymentState,
    pub complete: bool,
}

impl From<&DeploymentStatus> for PublishContext {
    fn from(status: &DeploymentStatus) -> Self {
        Self {
            deployment_id: status.id.clone(),
            status: status.status,
            complete: status.complete,
        }
    }
}

/// Registered web hook
///
/// An empty `id` means "not assigned yet"; the hooks manager fills it in on
/// registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebHook {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "event")]
    pub hook_event_type: HookEventType,
    #[serde(rename = "url")]
    pub hook_address: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure_ssl: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_publish_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_publish_status: Option<PublishStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_publish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_context: Option<PublishContext>,
}

impl WebHook {
    pub fn new(hook_event_type: HookEventType, hook_address: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            hook_event_type,
            hook_address: hook_address.into(),
            insecure_ssl: false,
            last_publish_date: None,
            last_publish_status: None,
            last_publish_reason: None,
            last_context: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_insecure_ssl(mut self, insecure_ssl: bool) -> Self {
        self.insecure_ssl = insecure_ssl;
        self
    }

    /// Addresses are unique case-insensitively, ignoring surrounding whitespace
    pub fn matches_address(&self, address: &str) -> bool {
        self.hook_address
            .trim()
            .eq_ignore_ascii_case(address.trim())
    }

    pub fn record_publish(
        &mut self,
        status: PublishStatus,
        reason: impl Into<String>,
        context: PublishContext,
        at: DateTime<Utc>,
    ) {
        self.last_publish_date = Some(at);
        self.last_publish_status = Some(status);
        self.last_publish_reason = Some(reason.into());
        self.last_context = Some(context);
    }
}
