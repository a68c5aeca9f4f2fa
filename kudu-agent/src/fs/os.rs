//! Real disk implementation of [`FileSystem`]

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::SystemTime;

use super::{DirEntry, FileSystem};

#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

impl OsFileSystem {
    pub fn new() -> Self {
        Self
    }
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

impl FileSystem for OsFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        ensure_parent(path)?;
        fs::write(path, data)
    }

    fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        ensure_parent(path)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(data)
    }

    fn create_new(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        ensure_parent(path)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(data)?;
        file.sync_all()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if to.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", to.display()),
            ));
        }
        fs::rename(from, to)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let path = entry.path();
            entries.push(DirEntry {
                is_dir: path.is_dir(),
                path,
            });
        }
        Ok(entries)
    }

    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        fs::metadata(path)?.modified()
    }

    fn file_len(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFileSystem::new();
        let settings = dir.path().join("jobs/triggered/backup/settings.job");

        fs.write_atomic(&settings, b"{\"a\":1}").unwrap();
        fs.write_atomic(&settings, b"{\"a\":2}").unwrap();

        assert_eq!(fs.read_to_string(&settings).unwrap(), "{\"a\":2}");
        // No temp files left behind
        assert_eq!(
            fs.list_files(settings.parent().unwrap()).unwrap(),
            vec![settings.clone()]
        );
        assert_eq!(
            fs.list_dirs(&dir.path().join("jobs/triggered")).unwrap(),
            vec![dir.path().join("jobs/triggered/backup")]
        );
        assert!(fs.list_dirs(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_create_new_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFileSystem::new();
        let marker = dir.path().join("locks/deploy.lock");

        fs.create_new(&marker, b"one").unwrap();
        let err = fs.create_new(&marker, b"two").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs.read(&marker).unwrap(), b"one");
    }

    #[test]
    fn test_rename_refuses_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let fs = OsFileSystem::new();
        fs.create_dir_all(&dir.path().join("a")).unwrap();
        fs.create_dir_all(&dir.path().join("b")).unwrap();
        assert!(fs.rename(&dir.path().join("a"), &dir.path().join("b")).is_err());
    }
}
