//! Configuration module
//!
//! Handles CLI configuration and opening the site it points at.

use std::path::PathBuf;

use anyhow::{Context, Result};
use kudu_agent::Site;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Site root
    pub root: PathBuf,
    /// Read-only jobs tree, overrides the agent environment
    pub secondary_jobs_path: Option<PathBuf>,
}

impl Config {
    /// Agent settings for this root
    ///
    /// Tunables still come from the `KUDU_*` environment so the CLI agrees
    /// with a running agent on lock backend and timeouts.
    pub fn site_config(&self) -> Result<kudu_agent::Config> {
        let mut config = kudu_agent::Config::from_env()
            .unwrap_or_else(|_| kudu_agent::Config::new(&self.root));
        config.root_path = self.root.clone();
        if self.secondary_jobs_path.is_some() {
            config.secondary_jobs_path = self.secondary_jobs_path.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn open_site(&self) -> Result<Site> {
        let config = self.site_config()?;
        Site::open(config).with_context(|| format!("Failed to open site {}", self.root.display()))
    }
}
