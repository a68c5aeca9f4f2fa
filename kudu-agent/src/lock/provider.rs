//! Named lock lookup

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

use super::{LeaseLock, OperationLock, OsFileLock};
use crate::config::LockBackend;
use crate::fs::FileSystem;

/// Hands out the lock for a name
///
/// Every caller in a process asking for the same name gets the same
/// instance, so in-process contention is decided by that instance and
/// cross-process contention by its backing file.
pub trait LockProvider: Send + Sync {
    fn get_lock(&self, name: &str) -> Arc<dyn OperationLock>;
}

/// Locks backed by files under `{root}/locks`
#[derive(Debug)]
pub struct FileLockProvider {
    locks_path: PathBuf,
    fs: Arc<dyn FileSystem>,
    backend: LockBackend,
    stale_after: Duration,
    locks: Mutex<HashMap<String, Arc<dyn OperationLock>>>,
}

impl FileLockProvider {
    /// `Auto` is resolved here by probing the locks directory
    pub fn new(
        locks_path: impl Into<PathBuf>,
        fs: Arc<dyn FileSystem>,
        backend: LockBackend,
        stale_after: Duration,
    ) -> Self {
        let locks_path = locks_path.into();
        let backend = match backend {
            LockBackend::Auto => {
                if OsFileLock::is_supported(&locks_path) {
                    LockBackend::Os
                } else {
                    warn!(
                        "Advisory locks unavailable in {}, using lease files",
                        locks_path.display()
                    );
                    LockBackend::Lease
                }
            }
            other => other,
        };
        info!("Using {:?} locks in {}", backend, locks_path.display());

        Self {
            locks_path,
            fs,
            backend,
            stale_after,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> LockBackend {
        self.backend
    }

    /// Names of lock files currently present
    pub fn known_lock_names(&self) -> Vec<String> {
        self.fs
            .list_files(&self.locks_path)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?;
                name.strip_suffix(".lock")
                    .filter(|n| !n.starts_with('.'))
                    .map(str::to_string)
            })
            .collect()
    }

    fn create(&self, name: &str) -> Arc<dyn OperationLock> {
        let path = self.locks_path.join(format!("{}.lock", name));
        match self.backend {
            LockBackend::Lease => Arc::new(LeaseLock::new(
                name,
                path,
                Arc::clone(&self.fs),
                self.stale_after,
            )),
            LockBackend::Os | LockBackend::Auto => Arc::new(OsFileLock::new(name, path)),
        }
    }
}

impl LockProvider for FileLockProvider {
    fn get_lock(&self, name: &str) -> Arc<dyn OperationLock> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            locks
                .entry(name.to_string())
                .or_insert_with(|| self.create(name)),
        )
    }
}
