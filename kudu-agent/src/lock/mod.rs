//! Named operation locks
//!
//! An [`OperationLock`] gives cross-process mutual exclusion for one named
//! operation (a deployment, a triggered run, the hooks file, a singleton
//! continuous job). Two backends exist:
//! - [`OsFileLock`]: OS advisory lock on an open handle; released by the
//!   kernel if the holder dies
//! - [`LeaseLock`]: marker file created exclusively; reclaimable once it has
//!   not been renewed for the stale window
//!
//! Acquisition with a timeout is a free function over the trait so every
//! backend gets the same backoff behaviour.

mod lease;
mod os;
mod provider;

pub use lease::LeaseLock;
pub use os::OsFileLock;
pub use provider::{FileLockProvider, LockProvider};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{CoordinatorError, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Errors raised by lock backends
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("lock '{0}' is no longer held by this holder")]
    Lost(String),
}

/// Holder marker written into the lock file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub holder_id: String,
    pub pid: u32,
    pub operation: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(holder_id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            holder_id: holder_id.into(),
            pid: std::process::id(),
            operation: operation.into(),
            acquired_at: Utc::now(),
        }
    }
}

/// Exclusive, non-reentrant named lock
pub trait OperationLock: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Whether any holder (this process or another) currently has the lock
    fn is_held(&self) -> bool;

    /// Single acquisition attempt
    fn try_lock(&self, operation: &str) -> std::result::Result<bool, LockError>;

    /// Release if held by this instance; calling it again is a no-op
    fn release(&self);

    /// Current holder, if it can be determined
    fn info(&self) -> Option<LockInfo>;

    /// Extend the holder's claim; backends without expiry ignore this
    fn renew(&self) -> std::result::Result<(), LockError> {
        Ok(())
    }
}

/// Releases the lock when dropped, including during unwinding
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct LockGuard {
    lock: Arc<dyn OperationLock>,
}

impl LockGuard {
    pub fn lock(&self) -> &Arc<dyn OperationLock> {
        &self.lock
    }

    /// Renew the lock every `interval` until the guard is dropped
    pub fn spawn_renewal(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let lock = Arc::clone(&self.lock);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = lock.renew() {
                    tracing::warn!("Failed to renew lock {}: {}", lock.name(), e);
                    return;
                }
            }
        })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Try to acquire `lock`, retrying with exponential backoff until `timeout`
///
/// Returns `Ok(false)` when the timeout elapses; only backend failures are
/// errors.
pub async fn try_acquire(
    lock: &dyn OperationLock,
    operation: &str,
    timeout: Duration,
) -> std::result::Result<bool, LockError> {
    let deadline = Instant::now() + timeout;
    let mut delay = INITIAL_BACKOFF;

    loop {
        if lock.try_lock(operation)? {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            debug!("Timed out waiting for lock {}", lock.name());
            return Ok(false);
        }
        tokio::time::sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(MAX_BACKOFF);
    }
}

/// Acquire `lock` and wrap it in a guard, or `None` on timeout
pub async fn acquire_guard(
    lock: &Arc<dyn OperationLock>,
    operation: &str,
    timeout: Duration,
) -> std::result::Result<Option<LockGuard>, LockError> {
    if try_acquire(lock.as_ref(), operation, timeout).await? {
        Ok(Some(LockGuard {
            lock: Arc::clone(lock),
        }))
    } else {
        Ok(None)
    }
}

/// Run `action` while holding `lock`
///
/// The lock is released whether the action succeeds, fails, panics or is
/// cancelled. If the lock cannot be acquired within `timeout` the result is
/// [`CoordinatorError::Busy`].
pub async fn lock_operation<T, F, Fut>(
    lock: &Arc<dyn OperationLock>,
    operation: &str,
    timeout: Duration,
    action: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let Some(_guard) = acquire_guard(lock, operation, timeout).await? else {
        return Err(CoordinatorError::busy(operation));
    };
    action().await
}

#[cfg(test)]
pub(crate) mod testing {
    //! Lock test doubles

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-process lock that records how many holders overlapped
    #[derive(Debug, Default)]
    pub struct TrackingLock {
        name: String,
        held: Mutex<bool>,
        pub holders: AtomicUsize,
        pub max_holders: AtomicUsize,
        pub acquisitions: AtomicUsize,
    }

    impl TrackingLock {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                ..Default::default()
            }
        }
    }

    impl OperationLock for TrackingLock {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_held(&self) -> bool {
            *self.held.lock().unwrap()
        }

        fn try_lock(&self, _operation: &str) -> std::result::Result<bool, LockError> {
            let mut held = self.held.lock().unwrap();
            if *held {
                return Ok(false);
            }
            *held = true;
            let now = self.holders.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_holders.fetch_max(now, Ordering::SeqCst);
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        fn release(&self) {
            let mut held = self.held.lock().unwrap();
            if *held {
                *held = false;
                self.holders.fetch_sub(1, Ordering::SeqCst);
            }
        }

        fn info(&self) -> Option<LockInfo> {
            None
        }
    }

    /// Provider handing out one [`TrackingLock`] per name
    #[derive(Debug, Default)]
    pub struct TrackingLockProvider {
        locks: Mutex<HashMap<String, Arc<TrackingLock>>>,
    }

    impl TrackingLockProvider {
        pub fn tracking(&self, name: &str) -> Arc<TrackingLock> {
            Arc::clone(
                self.locks
                    .lock()
                    .unwrap()
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(TrackingLock::new(name))),
            )
        }
    }

    impl LockProvider for TrackingLockProvider {
        fn get_lock(&self, name: &str) -> Arc<dyn OperationLock> {
            self.tracking(name)
        }
    }
}
