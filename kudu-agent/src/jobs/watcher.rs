//! Polling change detection for job trees
//!
//! Every interval each job directory is fingerprinted (relative paths and
//! modification times of all files). A job whose fingerprint changes is
//! reported once it has been quiet for the debounce period, so an upload
//! writing many files produces a single notification.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::manager::JobsManager;
use crate::fs::FileSystem;

type Fingerprint = Vec<(PathBuf, Option<SystemTime>)>;

fn fingerprint(fs: &dyn FileSystem, root: &Path) -> std::io::Result<Fingerprint> {
    let mut entries = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs.read_dir(&dir)? {
            if entry.is_dir {
                pending.push(entry.path);
            } else {
                let modified = fs.modified(&entry.path).ok();
                let relative = entry
                    .path
                    .strip_prefix(root)
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|_| entry.path.clone());
                entries.push((relative, modified));
            }
        }
    }
    entries.sort();
    Ok(entries)
}

struct WatchedSource {
    manager: Arc<JobsManager>,
    known: Option<BTreeMap<String, Fingerprint>>,
    /// Changed job name and when it last changed
    pending: HashMap<String, Instant>,
}

pub struct JobsWatcher {
    sources: Vec<WatchedSource>,
    interval: Duration,
    debounce: Duration,
}

impl JobsWatcher {
    pub fn new(managers: Vec<Arc<JobsManager>>, interval: Duration, debounce: Duration) -> Self {
        let sources = managers
            .into_iter()
            .map(|manager| WatchedSource {
                manager,
                known: None,
                pending: HashMap::new(),
            })
            .collect();
        Self {
            sources,
            interval,
            debounce,
        }
    }

    /// Poll until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "Watching {} job source(s) (interval: {:?}, debounce: {:?})",
            self.sources.len(),
            self.interval,
            self.debounce
        );
        let mut interval = time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let changed = self.poll_once(Instant::now());
                    if !changed.is_empty() {
                        info!("Detected changes in job(s): {}", changed.join(", "));
                    }
                }
            }
        }
        debug!("Job watcher stopped");
    }

    /// One scan; returns the jobs whose changes were reported
    ///
    /// The first scan of a source only records its state.
    pub fn poll_once(&mut self, now: Instant) -> Vec<String> {
        let mut reported = Vec::new();

        for source in &mut self.sources {
            let manager = &source.manager;
            let current = match Self::scan(manager) {
                Ok(current) => current,
                Err(e) => {
                    warn!(
                        "Failed to scan {} jobs in {}: {}",
                        manager.kind(),
                        manager.binaries_path().display(),
                        e
                    );
                    continue;
                }
            };

            if let Some(known) = &source.known {
                for (name, print) in &current {
                    if known.get(name) != Some(print) {
                        source.pending.insert(name.clone(), now);
                    }
                }
                for name in known.keys() {
                    if !current.contains_key(name) {
                        source.pending.insert(name.clone(), now);
                    }
                }
            }
            source.known = Some(current);

            let debounce = self.debounce;
            let ready: Vec<String> = source
                .pending
                .iter()
                .filter(|(_, changed_at)| now.duration_since(**changed_at) >= debounce)
                .map(|(name, _)| name.clone())
                .collect();
            for name in ready {
                source.pending.remove(&name);
                manager.notify_change(Some(&name));
                reported.push(name);
            }
        }

        reported.sort();
        reported
    }

    fn scan(manager: &JobsManager) -> std::io::Result<BTreeMap<String, Fingerprint>> {
        let fs = manager.fs().as_ref();
        let mut jobs = BTreeMap::new();
        for dir in fs.list_dirs(manager.binaries_path())? {
            let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            jobs.insert(name.to_string(), fingerprint(fs, &dir)?);
        }
        Ok(jobs)
    }
}
