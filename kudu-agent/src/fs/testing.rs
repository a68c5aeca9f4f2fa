//! Fault injection over [`InMemoryFileSystem`]

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use super::{DirEntry, FileSystem, InMemoryFileSystem};

type Hook = Box<dyn FnOnce() + Send>;

/// Delegates to an in-memory tree, failing reads below denied paths and
/// running a one-shot hook before the next rename
pub struct FaultyFileSystem {
    inner: Arc<InMemoryFileSystem>,
    denied: Mutex<Vec<PathBuf>>,
    before_rename: Mutex<Option<Hook>>,
}

impl fmt::Debug for FaultyFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultyFileSystem")
            .field("denied", &self.denied.lock().unwrap())
            .finish()
    }
}

impl FaultyFileSystem {
    pub fn new(inner: Arc<InMemoryFileSystem>) -> Self {
        Self {
            inner,
            denied: Mutex::new(Vec::new()),
            before_rename: Mutex::new(None),
        }
    }

    /// Reads of `path` and anything below it fail with `PermissionDenied`
    pub fn deny_reads(&self, path: impl Into<PathBuf>) {
        self.denied.lock().unwrap().push(path.into());
    }

    pub fn allow_reads(&self) {
        self.denied.lock().unwrap().clear();
    }

    pub fn before_next_rename(&self, hook: impl FnOnce() + Send + 'static) {
        *self.before_rename.lock().unwrap() = Some(Box::new(hook));
    }

    fn check_read(&self, path: &Path) -> io::Result<()> {
        if self.denied.lock().unwrap().iter().any(|d| path.starts_with(d)) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is not readable", path.display()),
            ));
        }
        Ok(())
    }
}

impl FileSystem for FaultyFileSystem {
    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.inner.is_dir(path)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.check_read(path)?;
        self.inner.read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.inner.write(path, data)
    }

    fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.inner.append(path, data)
    }

    fn create_new(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.inner.create_new(path, data)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let hook = self.before_rename.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        self.inner.rename(from, to)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        self.check_read(path)?;
        self.inner.read_dir(path)
    }

    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        self.inner.modified(path)
    }
}
