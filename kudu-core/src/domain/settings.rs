//! Per-job settings (`settings.job`)
//!
//! Settings are an open map of string keys to JSON values. Recognized keys
//! have typed accessors that fall back to a default when the key is missing
//! or holds a value of the wrong type; unknown keys are carried through
//! untouched so a read-modify-write never loses data.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Settings file name inside a job directory
pub const SETTINGS_FILE_NAME: &str = "settings.job";

pub const IS_SINGLETON: &str = "is_singleton";
pub const STOPPING_WAIT_TIME: &str = "stopping_wait_time";
pub const SCHEDULE: &str = "schedule";
pub const IS_IN_PLACE: &str = "is_in_place";
pub const EXPOSE_HTTP: &str = "expose_http";
pub const TIMEOUT: &str = "timeout";

/// Settings of one job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobSettings(BTreeMap<String, Value>);

impl JobSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed lookup; `None` when missing or not convertible to `T`
    pub fn get_setting<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn get_setting_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get_setting(key).unwrap_or(default)
    }

    pub fn get_raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set_setting(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove_setting(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_singleton(&self) -> bool {
        self.get_setting_or(IS_SINGLETON, false)
    }

    /// Grace period between the shutdown notification and a forced kill
    pub fn stopping_wait_time(&self, default: Duration) -> Duration {
        self.seconds(STOPPING_WAIT_TIME).unwrap_or(default)
    }

    /// Cron expression, if a non-blank one is configured
    pub fn schedule(&self) -> Option<String> {
        self.get_setting::<String>(SCHEDULE)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn is_in_place(&self) -> bool {
        self.get_setting_or(IS_IN_PLACE, false)
    }

    pub fn expose_http(&self) -> bool {
        self.get_setting_or(EXPOSE_HTTP, false)
    }

    /// Hard limit on a triggered run's wall-clock time
    pub fn run_timeout(&self) -> Option<Duration> {
        self.seconds(TIMEOUT).filter(|d| !d.is_zero())
    }

    fn seconds(&self, key: &str) -> Option<Duration> {
        self.get_setting::<f64>(key)
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
    }
}

impl FromIterator<(String, Value)> for JobSettings {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
