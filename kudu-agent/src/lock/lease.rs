//! Lease marker file backend
//!
//! For file systems without working advisory locks (some network shares).
//! The presence of the marker is the lock; its modification time is the
//! lease, extended by [`OperationLock::renew`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use super::{LockError, LockInfo, OperationLock};
use crate::fs::FileSystem;

#[derive(Debug)]
pub struct LeaseLock {
    name: String,
    path: PathBuf,
    fs: Arc<dyn FileSystem>,
    stale_after: Duration,
    holder_id: String,
    held: Mutex<Option<LockInfo>>,
}

impl LeaseLock {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        fs: Arc<dyn FileSystem>,
        stale_after: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            fs,
            stale_after,
            holder_id: uuid::Uuid::new_v4().to_string(),
            held: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn held(&self) -> MutexGuard<'_, Option<LockInfo>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stale(&self) -> bool {
        self.is_stale_at(&self.path)
    }

    fn is_stale_at(&self, path: &Path) -> bool {
        match self.fs.modified(path) {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .map(|age| age > self.stale_after)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    fn tombstone_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.path
            .with_file_name(format!(".{}.{}.reclaim", file_name, uuid::Uuid::new_v4()))
    }

    /// Take over a marker judged stale with contents `stale`
    ///
    /// The marker is renamed to a private tombstone first. Only a tombstone
    /// that still holds `stale` and is still stale is discarded; anything
    /// else is a live marker another reclaimer created meanwhile, and is put
    /// back.
    fn reclaim(&self, stale: &[u8], info: &LockInfo) -> Result<bool, LockError> {
        let tombstone = self.tombstone_path();
        match self.fs.rename(&self.path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(self.create_marker(info)?),
            Err(e) => return Err(e.into()),
        }

        let moved = self.fs.read(&tombstone);
        let was_stale = matches!(&moved, Ok(data) if data.as_slice() == stale)
            && self.is_stale_at(&tombstone);
        if !was_stale {
            debug!("Lease {} was taken over while reclaiming, restoring it", self.name);
            if let Ok(data) = &moved {
                match self.fs.create_new(&self.path, data) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        warn!("Lease {} was replaced before it could be restored", self.name);
                    }
                    Err(e) => warn!("Failed to restore lease {}: {}", self.name, e),
                }
            }
            self.fs.remove_file_if_exists(&tombstone)?;
            return Ok(false);
        }

        warn!(
            "Reclaiming stale lock {} held by {:?}",
            self.name,
            serde_json::from_slice::<LockInfo>(stale).ok().map(|i| i.holder_id)
        );
        self.fs.remove_file_if_exists(&tombstone)?;
        Ok(self.create_marker(info)?)
    }

    fn read_marker(&self) -> Option<LockInfo> {
        let data = self.fs.read(&self.path).ok()?;
        serde_json::from_slice(&data).ok()
    }

    fn create_marker(&self, info: &LockInfo) -> io::Result<bool> {
        let data = serde_json::to_vec(info).map_err(io::Error::other)?;
        match self.fs.create_new(&self.path, &data) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn owns_marker(&self) -> bool {
        self.read_marker()
            .is_some_and(|info| info.holder_id == self.holder_id)
    }
}

impl OperationLock for LeaseLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_held(&self) -> bool {
        self.held().is_some() || (self.fs.exists(&self.path) && !self.is_stale())
    }

    fn try_lock(&self, operation: &str) -> Result<bool, LockError> {
        let mut held = self.held();
        if held.is_some() {
            return Ok(false);
        }

        let info = LockInfo::new(&self.holder_id, operation);
        let mut acquired = self.create_marker(&info)?;

        if !acquired && self.is_stale() {
            if let Ok(stale) = self.fs.read(&self.path) {
                acquired = self.reclaim(&stale, &info)?;
            }
        }

        if acquired {
            debug!("Acquired lease {} for {}", self.name, operation);
            *held = Some(info);
        }
        Ok(acquired)
    }

    fn release(&self) {
        let Some(_) = self.held().take() else {
            return;
        };
        if !self.owns_marker() {
            warn!("Lease {} was reclaimed by another holder", self.name);
            return;
        }
        if let Err(e) = self.fs.remove_file_if_exists(&self.path) {
            warn!("Failed to remove lease marker {}: {}", self.path.display(), e);
        }
        debug!("Released lease {}", self.name);
    }

    fn info(&self) -> Option<LockInfo> {
        if !self.is_held() {
            return None;
        }
        self.read_marker()
    }

    fn renew(&self) -> Result<(), LockError> {
        let held = self.held();
        let Some(info) = held.as_ref() else {
            return Err(LockError::Lost(self.name.clone()));
        };
        if !self.owns_marker() {
            return Err(LockError::Lost(self.name.clone()));
        }
        let data = serde_json::to_vec(info).map_err(io::Error::other)?;
        self.fs.write(&self.path, &data)?;
        Ok(())
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;
    use crate::fs::testing::FaultyFileSystem;
    use crate::lock::lock_operation;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lease(fs: &Arc<InMemoryFileSystem>, stale_after: Duration) -> LeaseLock {
        LeaseLock::new(
            "deploy",
            "/site/locks/deploy.lock",
            fs.clone() as Arc<dyn FileSystem>,
            stale_after,
        )
    }

    #[test]
    fn test_lock_twice_then_release() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let first = lease(&fs, Duration::from_secs(60));
        let second = lease(&fs, Duration::from_secs(60));

        assert!(first.try_lock("deploy").unwrap());
        assert!(!first.try_lock("deploy").unwrap());
        assert!(!second.try_lock("deploy").unwrap());
        assert!(second.is_held());
        assert_eq!(second.info().unwrap().operation, "deploy");

        first.release();
        first.release();
        assert!(!fs.exists(Path::new("/site/locks/deploy.lock")));
        assert!(second.try_lock("deploy").unwrap());
    }

    #[test]
    fn test_stale_marker_is_reclaimed() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let crashed = lease(&fs, Duration::from_secs(60));
        let survivor = lease(&fs, Duration::from_secs(60));
        assert!(crashed.try_lock("deploy").unwrap());

        fs.set_modified(
            Path::new("/site/locks/deploy.lock"),
            SystemTime::now() - Duration::from_secs(120),
        )
        .unwrap();

        assert!(!survivor.is_held());
        assert!(survivor.try_lock("deploy").unwrap());

        // The old holder lost its lease and must not delete the new marker
        assert!(matches!(crashed.renew(), Err(LockError::Lost(_))));
        crashed.release();
        assert!(fs.exists(Path::new("/site/locks/deploy.lock")));
        assert!(survivor.renew().is_ok());
    }

    fn expire(fs: &InMemoryFileSystem) {
        fs.set_modified(
            Path::new("/site/locks/deploy.lock"),
            SystemTime::now() - Duration::from_secs(120),
        )
        .unwrap();
    }

    #[test]
    fn test_concurrent_reclaimers_never_share_the_lease() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let crashed = lease(&fs, Duration::from_secs(60));
        assert!(crashed.try_lock("deploy").unwrap());
        expire(&fs);

        let first = Arc::new(lease(&fs, Duration::from_secs(60)));
        let faulty = Arc::new(FaultyFileSystem::new(fs.clone()));
        let second = LeaseLock::new(
            "deploy",
            "/site/locks/deploy.lock",
            faulty.clone() as Arc<dyn FileSystem>,
            Duration::from_secs(60),
        );

        // `second` has judged the marker stale; `first` reclaims it before
        // `second` gets to move it
        let racer = Arc::clone(&first);
        faulty.before_next_rename(move || {
            assert!(racer.try_lock("deploy").unwrap());
        });

        assert!(!second.try_lock("deploy").unwrap());
        assert!(first.renew().is_ok());
        assert!(matches!(second.renew(), Err(LockError::Lost(_))));
        assert_eq!(
            fs.list_files(Path::new("/site/locks")).unwrap(),
            vec![PathBuf::from("/site/locks/deploy.lock")]
        );

        first.release();
        assert!(second.try_lock("deploy").unwrap());
    }

    #[test]
    fn test_reclaim_after_marker_released() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let crashed = lease(&fs, Duration::from_secs(60));
        assert!(crashed.try_lock("deploy").unwrap());
        expire(&fs);

        let faulty = Arc::new(FaultyFileSystem::new(fs.clone()));
        let reclaimer = LeaseLock::new(
            "deploy",
            "/site/locks/deploy.lock",
            faulty.clone() as Arc<dyn FileSystem>,
            Duration::from_secs(60),
        );
        let inner = fs.clone();
        faulty.before_next_rename(move || {
            inner
                .remove_file(Path::new("/site/locks/deploy.lock"))
                .unwrap();
        });

        assert!(reclaimer.try_lock("deploy").unwrap());
        assert!(reclaimer.renew().is_ok());
    }

    #[test]
    fn test_renew_keeps_lease_fresh() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let holder = lease(&fs, Duration::from_secs(60));
        let other = lease(&fs, Duration::from_secs(60));
        assert!(holder.try_lock("run").unwrap());

        fs.set_modified(
            Path::new("/site/locks/deploy.lock"),
            SystemTime::now() - Duration::from_secs(59),
        )
        .unwrap();
        holder.renew().unwrap();

        assert!(!other.try_lock("run").unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stress_mutual_exclusion() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let lock: Arc<dyn OperationLock> = Arc::new(lease(&fs, Duration::from_secs(60)));
            let inside = Arc::clone(&inside);
            let total = Arc::clone(&total);
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    lock_operation(&lock, "stress", Duration::from_secs(30), || async {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        tokio::task::yield_now().await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        total.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), crate::error::CoordinatorError>(())
                    })
                    .await
                    .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(total.load(Ordering::SeqCst), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stress_with_varied_timeouts() {
        let fs = Arc::new(InMemoryFileSystem::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let acquired = Arc::new(AtomicUsize::new(0));
        let busy = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for seed in 0..10u64 {
            let lock: Arc<dyn OperationLock> = Arc::new(lease(&fs, Duration::from_secs(60)));
            let inside = Arc::clone(&inside);
            let acquired = Arc::clone(&acquired);
            let busy = Arc::clone(&busy);
            tasks.push(tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..10 {
                    // Some waits give up before the holder finishes
                    let timeout = Duration::from_millis(rng.gen_range(0..=20));
                    let result = lock_operation(&lock, "stress", timeout, || async {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok::<(), crate::error::CoordinatorError>(())
                    })
                    .await;
                    match result {
                        Ok(()) => acquired.fetch_add(1, Ordering::SeqCst),
                        Err(e) if e.is_busy() => busy.fetch_add(1, Ordering::SeqCst),
                        Err(e) => panic!("unexpected lock failure: {e}"),
                    };
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let acquired = acquired.load(Ordering::SeqCst);
        assert!(acquired > 0);
        assert_eq!(acquired + busy.load(Ordering::SeqCst), 100);
        // Every timed-out waiter left the marker alone
        assert!(!fs.exists(Path::new("/site/locks/deploy.lock")));
    }
}
