//! File system seam
//!
//! Managers never touch `std::fs` directly; they go through [`FileSystem`] so
//! that job trees, settings and the hooks file can be exercised against an
//! in-memory tree in tests.
//!
//! - [`OsFileSystem`]: the real disk
//! - [`InMemoryFileSystem`]: a `BTreeMap`-backed tree for tests and tooling

mod memory;
mod os;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::InMemoryFileSystem;
pub use os::OsFileSystem;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Entry returned by [`FileSystem::read_dir`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Synchronous file system operations used by the coordinator
///
/// `write`, `append` and `create_new` create missing parent directories.
/// `rename` replaces an existing destination file but refuses to replace an
/// existing directory.
pub trait FileSystem: Send + Sync + fmt::Debug {
    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    fn append(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Create `path` with `data`; fails with `AlreadyExists` if it is present
    fn create_new(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;

    fn modified(&self, path: &Path) -> io::Result<SystemTime>;

    /// Size of the file at `path` in bytes
    fn file_len(&self, path: &Path) -> io::Result<u64> {
        Ok(self.read(path)?.len() as u64)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Write to a sibling temp file, then rename it over `path`
    ///
    /// Readers observe either the old or the new content, never a torn write.
    fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        let temp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        self.write(&temp, data)?;
        if let Err(e) = self.rename(&temp, path) {
            let _ = self.remove_file(&temp);
            return Err(e);
        }
        Ok(())
    }

    /// Sorted child directories; a missing directory has none
    fn list_dirs(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        list_entries(self, path, true)
    }

    /// Sorted child files; a missing directory has none
    fn list_files(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        list_entries(self, path, false)
    }

    /// Recursively copy the directory `from` to `to`
    fn copy_dir_all(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.create_dir_all(to)?;
        for entry in self.read_dir(from)? {
            let Some(name) = entry.path.file_name() else {
                continue;
            };
            let target = to.join(name);
            if entry.is_dir {
                self.copy_dir_all(&entry.path, &target)?;
            } else {
                let data = self.read(&entry.path)?;
                self.write(&target, &data)?;
            }
        }
        Ok(())
    }

    /// Remove a file, treating "already gone" as success
    fn remove_file_if_exists(&self, path: &Path) -> io::Result<()> {
        match self.remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Remove a directory tree, treating "already gone" as success
    fn remove_dir_all_if_exists(&self, path: &Path) -> io::Result<()> {
        match self.remove_dir_all(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

fn list_entries<F: FileSystem + ?Sized>(fs: &F, path: &Path, dirs: bool) -> io::Result<Vec<PathBuf>> {
    let entries = match fs.read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut paths: Vec<PathBuf> = entries
        .into_iter()
        .filter(|entry| entry.is_dir == dirs)
        .map(|entry| entry.path)
        .collect();
    paths.sort();
    Ok(paths)
}

/// Read `path`, mapping "not found" to `None`
pub fn read_optional(fs: &dyn FileSystem, path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs.read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
