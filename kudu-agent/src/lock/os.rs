//! OS advisory lock backend

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use super::{LockError, LockInfo, OperationLock};

/// Exclusive advisory lock on `{locks}/{name}.lock`
///
/// The handle stays open while held; the kernel drops the lock if the process
/// exits. The file itself is never deleted, so there is no window in which
/// two processes lock different inodes of the same path.
#[derive(Debug)]
pub struct OsFileLock {
    name: String,
    path: PathBuf,
    holder_id: String,
    handle: Mutex<Option<File>>,
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

impl OsFileLock {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            holder_id: uuid::Uuid::new_v4().to_string(),
            handle: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&self) -> MutexGuard<'_, Option<File>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_info(file: &mut File, info: &LockInfo) -> io::Result<()> {
        let data = serde_json::to_vec(info).map_err(io::Error::other)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&data)?;
        file.flush()
    }

    /// Whether advisory locks work in `dir`
    pub fn is_supported(dir: &Path) -> bool {
        let check = dir.join(".support.lock");
        let supported = open_lock_file(&check)
            .and_then(|file| {
                FileExt::try_lock_exclusive(&file)?;
                FileExt::unlock(&file)
            })
            .is_ok();
        let _ = fs::remove_file(&check);
        supported
    }
}

impl OperationLock for OsFileLock {
    fn name(&self) -> &str {
        &self.name
    }

    /// Holders leave a marker in the file and `release` empties it, so a free
    /// lock is answered from the file size alone. A non-empty marker is
    /// confirmed with a non-blocking lock attempt; if that attempt succeeds
    /// the holder exited without releasing, and the stale marker is cleared
    /// before unlocking so later checks take the size path again.
    fn is_held(&self) -> bool {
        if self.handle().is_some() {
            return true;
        }
        let file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => file,
            Err(_) => return false,
        };
        if file.metadata().map(|m| m.len() == 0).unwrap_or(true) {
            return false;
        }
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!("Clearing marker left on lock {}", self.name);
                let _ = file.set_len(0);
                let _ = FileExt::unlock(&file);
                false
            }
            Err(e) => is_contended(&e),
        }
    }

    fn try_lock(&self, operation: &str) -> Result<bool, LockError> {
        let mut handle = self.handle();
        if handle.is_some() {
            return Ok(false);
        }

        let mut file = open_lock_file(&self.path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if is_contended(&e) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let info = LockInfo::new(&self.holder_id, operation);
        if let Err(e) = Self::write_info(&mut file, &info) {
            // The lock is still valid without the marker
            warn!("Failed to record holder of lock {}: {}", self.name, e);
        }
        debug!("Acquired lock {} for {}", self.name, operation);
        *handle = Some(file);
        Ok(true)
    }

    fn release(&self) {
        let Some(file) = self.handle().take() else {
            return;
        };
        let _ = file.set_len(0);
        if let Err(e) = FileExt::unlock(&file) {
            warn!("Failed to unlock {}: {}", self.name, e);
        }
        debug!("Released lock {}", self.name);
    }

    fn info(&self) -> Option<LockInfo> {
        if !self.is_held() {
            return None;
        }
        let mut content = String::new();
        File::open(&self.path)
            .and_then(|mut f| f.read_to_string(&mut content))
            .ok()?;
        serde_json::from_str(&content).ok()
    }
}

impl Drop for OsFileLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::lock_operation;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_lock_twice_then_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locks/deploy.lock");
        let first = OsFileLock::new("deploy", &path);
        let second = OsFileLock::new("deploy", &path);

        assert!(first.try_lock("deploy").unwrap());
        assert!(!first.try_lock("deploy").unwrap());
        assert!(!second.try_lock("deploy").unwrap());
        assert!(second.is_held());
        assert_eq!(second.info().unwrap().operation, "deploy");

        first.release();
        first.release();
        assert!(!second.is_held());
        assert!(second.try_lock("deploy").unwrap());
        // File stays in place between holders
        assert!(path.exists());
    }

    #[test]
    fn test_free_lock_is_reported_from_empty_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.lock");
        let lock = OsFileLock::new("deploy", &path);
        assert!(!lock.is_held());

        // Until a holder writes its marker the lock reads as free, and the
        // check leaves the holder's kernel lock undisturbed
        let raw = open_lock_file(&path).unwrap();
        FileExt::try_lock_exclusive(&raw).unwrap();
        assert!(!lock.is_held());
        assert!(lock.info().is_none());
        assert!(!OsFileLock::new("deploy", &path).try_lock("deploy").unwrap());
        FileExt::unlock(&raw).unwrap();

        assert!(lock.try_lock("deploy").unwrap());
        lock.release();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_marker_left_by_exited_holder_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.lock");
        {
            // Kernel lock dropped with the handle, marker left behind
            let mut raw = open_lock_file(&path).unwrap();
            FileExt::try_lock_exclusive(&raw).unwrap();
            OsFileLock::write_info(&mut raw, &LockInfo::new("gone", "deploy")).unwrap();
        }
        assert!(std::fs::metadata(&path).unwrap().len() > 0);

        let lock = OsFileLock::new("deploy", &path);
        assert!(!lock.is_held());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        assert!(lock.info().is_none());
        assert!(lock.try_lock("deploy").unwrap());
    }

    #[test]
    fn test_advisory_locks_supported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(OsFileLock::is_supported(dir.path()));
        assert!(!dir.path().join(".support.lock").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.lock");
        let counter_file = dir.path().join("counter");
        std::fs::write(&counter_file, "0").unwrap();
        let inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            // Separate instances contend through the kernel lock
            let lock: Arc<dyn OperationLock> = Arc::new(OsFileLock::new("counter", &path));
            let counter_file = counter_file.clone();
            let inside = Arc::clone(&inside);
            tasks.push(tokio::spawn(async move {
                for _ in 0..5 {
                    lock_operation(&lock, "increment", Duration::from_secs(30), || async {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        let value: u32 = std::fs::read_to_string(&counter_file)?.parse().unwrap();
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        std::fs::write(&counter_file, (value + 1).to_string())?;
                        inside.fetch_sub(1, Ordering::SeqCst);
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

        assert_eq!(std::fs::read_to_string(&counter_file).unwrap(), "40");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_increments_with_varied_timeouts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counter.lock");
        let counter_file = dir.path().join("counter");
        std::fs::write(&counter_file, "0").unwrap();
        let inside = Arc::new(AtomicUsize::new(0));
        let busy = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for seed in 0..8u64 {
            let lock: Arc<dyn OperationLock> = Arc::new(OsFileLock::new("counter", &path));
            let counter_file = counter_file.clone();
            let inside = Arc::clone(&inside);
            let busy = Arc::clone(&busy);
            tasks.push(tokio::spawn(async move {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..5 {
                    let timeout = Duration::from_millis(rng.gen_range(0..=15));
                    let result = lock_operation(&lock, "increment", timeout, || async {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        let value: u32 = std::fs::read_to_string(&counter_file)?.parse().unwrap();
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        std::fs::write(&counter_file, (value + 1).to_string())?;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok::<(), crate::error::CoordinatorError>(())
                    })
                    .await;
                    match result {
                        Ok(()) => {}
                        Err(e) if e.is_busy() => {
                            busy.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => panic!("unexpected lock failure: {e}"),
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Each attempt either incremented once or gave up without touching it
        let value: usize = std::fs::read_to_string(&counter_file)
            .unwrap()
            .parse()
            .unwrap();
        assert!(value > 0);
        assert_eq!(value + busy.load(Ordering::SeqCst), 40);
        assert!(!OsFileLock::new("counter", &path).is_held());
    }
}
