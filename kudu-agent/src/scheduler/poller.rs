//! Triggered jobs scheduler
//!
//! Fires triggered jobs that carry a `schedule` setting. Every tick:
//! - Reloads the schedules of jobs reported changed by the job sources
//! - Fires the jobs whose next occurrence has arrived through the
//!   lock-guarded invocation path, so several schedulers sharing a site
//!   never run the same job twice

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::schedule::Schedule;
use crate::error::{CoordinatorError, Result};
use crate::jobs::{ObserverToken, TriggeredJobsManager};

/// Names reported changed since the last tick
#[derive(Debug, Default)]
struct PendingChanges {
    all: bool,
    names: HashSet<String>,
}

#[derive(Debug)]
struct ScheduledJob {
    name: String,
    schedule: Schedule,
    due: DateTime<Utc>,
}

fn due_after(now: DateTime<Utc>, wait: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(wait).unwrap_or(chrono::Duration::zero())
}

pub struct TriggeredJobsScheduler {
    manager: Arc<TriggeredJobsManager>,
    interval: Duration,
    /// Keyed by lowercase job name
    entries: BTreeMap<String, ScheduledJob>,
    changes: Arc<Mutex<PendingChanges>>,
    _observers: Vec<ObserverToken>,
}

impl TriggeredJobsScheduler {
    pub fn new(manager: Arc<TriggeredJobsManager>, interval: Duration) -> Self {
        let changes = Arc::new(Mutex::new(PendingChanges {
            all: true,
            names: HashSet::new(),
        }));
        let sink = Arc::clone(&changes);
        let observers = manager.jobs().register_change_observer(move |change| {
            let mut pending = sink.lock().unwrap_or_else(PoisonError::into_inner);
            match &change.name {
                Some(name) => {
                    pending.names.insert(name.to_ascii_lowercase());
                }
                None => pending.all = true,
            }
        });

        Self {
            manager,
            interval,
            entries: BTreeMap::new(),
            changes,
            _observers: observers,
        }
    }

    /// Names of the jobs with a valid schedule
    pub fn scheduled_jobs(&self) -> Vec<String> {
        self.entries.values().map(|entry| entry.name.clone()).collect()
    }

    /// When `name` fires next
    pub fn next_due(&self, name: &str) -> Option<DateTime<Utc>> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|entry| entry.due)
    }

    /// Tick until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Starting triggered jobs scheduler (interval: {:?})", self.interval);

        let mut interval = time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let fired = self.tick(Utc::now()).await;
                    if fired > 0 {
                        info!("Fired {} scheduled job(s) this tick", fired);
                    }
                }
            }
        }
        debug!("Triggered jobs scheduler stopped");
    }

    /// One tick at `now`; returns the number of jobs fired
    pub async fn tick(&mut self, now: DateTime<Utc>) -> usize {
        self.refresh_schedules(now);

        let due: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.due <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut fired = 0;
        for key in due {
            if self.fire(&key, now).await {
                fired += 1;
            }
        }
        fired
    }

    /// Reload the schedules of changed jobs
    ///
    /// A job whose settings or history cannot be read keeps its current
    /// entry and is retried on the next tick; other jobs are still refreshed.
    fn refresh_schedules(&mut self, now: DateTime<Utc>) {
        let changes = std::mem::take(
            &mut *self.changes.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let names = if changes.all {
            match self.manager.jobs().list_jobs(true) {
                Ok(jobs) => {
                    let mut names: HashSet<String> = self.entries.keys().cloned().collect();
                    names.extend(changes.names);
                    names.extend(jobs.into_iter().map(|job| job.name.to_ascii_lowercase()));
                    names
                }
                Err(e) => {
                    error!("Failed to list triggered jobs: {}", e);
                    self.requeue(true, changes.names);
                    return;
                }
            }
        } else {
            changes.names
        };

        let mut failed = HashSet::new();
        for name in names {
            if let Err(e) = self.reschedule(&name, now) {
                error!("Failed to refresh schedule of triggered job {}: {}", name, e);
                failed.insert(name);
            }
        }
        if !failed.is_empty() {
            self.requeue(false, failed);
        }
    }

    fn requeue(&self, all: bool, names: HashSet<String>) {
        let mut pending = self.changes.lock().unwrap_or_else(PoisonError::into_inner);
        pending.all |= all;
        pending.names.extend(names);
    }

    /// Load or drop the schedule of `key` from its current settings
    fn reschedule(&mut self, key: &str, now: DateTime<Utc>) -> Result<()> {
        let schedule = match self.manager.jobs().get_job(key)? {
            Some(job) => job.settings.schedule().and_then(|expression| {
                match Schedule::parse(&expression) {
                    Ok(schedule) => Some((job.name, schedule)),
                    Err(e) => {
                        error!("Ignoring schedule of triggered job {}: {}", job.name, e);
                        None
                    }
                }
            }),
            None => None,
        };

        let Some((name, schedule)) = schedule else {
            if let Some(entry) = self.entries.remove(key) {
                info!("Removed schedule of triggered job {}", entry.name);
            }
            return Ok(());
        };

        let last_run = self.manager.latest_run_start(&name)?;
        let Some(wait) = schedule.next_interval(last_run, now, false) else {
            warn!("Schedule '{}' of {} has no future occurrence", schedule, name);
            self.entries.remove(key);
            return Ok(());
        };
        let due = due_after(now, wait);
        debug!("Scheduled triggered job {} ('{}') for {}", name, schedule, due);
        self.entries.insert(
            key.to_string(),
            ScheduledJob {
                name,
                schedule,
                due,
            },
        );
        Ok(())
    }

    /// Fire `key` if it is still on schedule and plan the next occurrence
    async fn fire(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        let Some(entry) = self.entries.get(key) else {
            return false;
        };
        let name = entry.name.clone();
        let schedule = entry.schedule.clone();

        // Another instance may have run it since this entry was planned
        let last_run = match self.manager.latest_run_start(&name) {
            Ok(last_run) => last_run.unwrap_or(now - chrono::Duration::minutes(1)),
            Err(e) => {
                error!("Failed to read history of {}: {}", name, e);
                now - chrono::Duration::minutes(1)
            }
        };
        let mut fired = false;
        let mut anchor = now;
        if schedule.next_interval(Some(last_run), now, true) == Some(Duration::ZERO) {
            let trigger = format!("Schedule - {}", schedule);
            match self
                .manager
                .invoke_triggered_job(&name, None, Some(trigger))
                .await
            {
                Ok(handle) => {
                    info!("Scheduled run {} of {} started", handle.run_id, name);
                    fired = true;
                }
                Err(e) if e.is_busy() => {
                    debug!("Triggered job {} is already running, skipping", name);
                }
                Err(CoordinatorError::JobNotFound(_)) => {
                    self.entries.remove(key);
                    return false;
                }
                Err(e) => {
                    error!("Failed to fire scheduled job {}: {}", name, e);
                }
            }
        } else {
            anchor = last_run;
        }

        match schedule.next_interval(Some(anchor), now, false) {
            Some(wait) => {
                if let Some(entry) = self.entries.get_mut(key) {
                    entry.due = due_after(now, wait);
                }
            }
            None => {
                self.entries.remove(key);
            }
        }
        fired
    }
}
