//! In-memory implementation of [`FileSystem`]
//!
//! Paths are stored as given; the file system root (`/` or an empty path)
//! always exists.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use super::{DirEntry, FileSystem};

#[derive(Debug, Clone)]
enum Node {
    Dir { modified: SystemTime },
    File { data: Vec<u8>, modified: SystemTime },
}

impl Node {
    fn modified(&self) -> SystemTime {
        match self {
            Node::Dir { modified } | Node::File { modified, .. } => *modified,
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFileSystem {
    nodes: Mutex<BTreeMap<PathBuf, Node>>,
}

fn is_root(path: &Path) -> bool {
    path.as_os_str().is_empty() || path.parent().is_none()
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} not found", path.display()),
    )
}

impl InMemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the modification time of an existing entry
    pub fn set_modified(&self, path: &Path, at: SystemTime) -> io::Result<()> {
        let mut nodes = self.nodes();
        match nodes.get_mut(path) {
            Some(Node::Dir { modified }) | Some(Node::File { modified, .. }) => {
                *modified = at;
                Ok(())
            }
            None => Err(not_found(path)),
        }
    }

    fn nodes(&self) -> MutexGuard<'_, BTreeMap<PathBuf, Node>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_dirs(nodes: &mut BTreeMap<PathBuf, Node>, path: &Path) -> io::Result<()> {
        let mut missing = Vec::new();
        for ancestor in path.ancestors() {
            if is_root(ancestor) {
                break;
            }
            match nodes.get(ancestor) {
                Some(Node::Dir { .. }) => break,
                Some(Node::File { .. }) => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotADirectory,
                        format!("{} is a file", ancestor.display()),
                    ));
                }
                None => missing.push(ancestor.to_path_buf()),
            }
        }
        let now = SystemTime::now();
        for dir in missing {
            nodes.insert(dir, Node::Dir { modified: now });
        }
        Ok(())
    }

    fn ensure_parent(nodes: &mut BTreeMap<PathBuf, Node>, path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) => Self::ensure_dirs(nodes, parent),
            None => Ok(()),
        }
    }

    fn put_file(nodes: &mut BTreeMap<PathBuf, Node>, path: &Path, data: Vec<u8>) -> io::Result<()> {
        if let Some(Node::Dir { .. }) = nodes.get(path) {
            return Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("{} is a directory", path.display()),
            ));
        }
        Self::ensure_parent(nodes, path)?;
        nodes.insert(
            path.to_path_buf(),
            Node::File {
                data,
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }
}

impl FileSystem for InMemoryFileSystem {
    fn exists(&self, path: &Path) -> bool {
        is_root(path) || self.nodes().contains_key(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        is_root(path) || matches!(self.nodes().get(path), Some(Node::Dir { .. }))
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        match self.nodes().get(path) {
            Some(Node::File { data, .. }) => Ok(data.clone()),
            Some(Node::Dir { .. }) => Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("{} is a directory", path.display()),
            )),
            None => Err(not_found(path)),
        }
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        Self::put_file(&mut self.nodes(), path, data.to_vec())
    }

    fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut nodes = self.nodes();
        let mut content = match nodes.get(path) {
            Some(Node::File { data, .. }) => data.clone(),
            _ => Vec::new(),
        };
        content.extend_from_slice(data);
        Self::put_file(&mut nodes, path, content)
    }

    fn create_new(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut nodes = self.nodes();
        if nodes.contains_key(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            ));
        }
        Self::put_file(&mut nodes, path, data.to_vec())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        Self::ensure_dirs(&mut self.nodes(), path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let mut nodes = self.nodes();
        match nodes.get(path) {
            Some(Node::File { .. }) => {
                nodes.remove(path);
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(io::Error::new(
                io::ErrorKind::IsADirectory,
                format!("{} is a directory", path.display()),
            )),
            None => Err(not_found(path)),
        }
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut nodes = self.nodes();
        if !matches!(nodes.get(path), Some(Node::Dir { .. })) {
            return Err(not_found(path));
        }
        nodes.retain(|p, _| !p.starts_with(path));
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut nodes = self.nodes();
        let node = nodes.get(from).cloned().ok_or_else(|| not_found(from))?;
        if matches!(nodes.get(to), Some(Node::Dir { .. })) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", to.display()),
            ));
        }
        if let Some(parent) = to.parent() {
            if !is_root(parent) && !matches!(nodes.get(parent), Some(Node::Dir { .. })) {
                return Err(not_found(parent));
            }
        }

        match node {
            Node::File { .. } => {
                nodes.remove(from);
                nodes.insert(to.to_path_buf(), node);
            }
            Node::Dir { .. } => {
                if to.starts_with(from) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "cannot move a directory into itself",
                    ));
                }
                let moved: Vec<(PathBuf, Node)> = nodes
                    .iter()
                    .filter(|(p, _)| p.starts_with(from))
                    .map(|(p, n)| (p.clone(), n.clone()))
                    .collect();
                for (path, node) in moved {
                    nodes.remove(&path);
                    let relative = path.strip_prefix(from).unwrap_or(Path::new(""));
                    let target = if relative.as_os_str().is_empty() {
                        to.to_path_buf()
                    } else {
                        to.join(relative)
                    };
                    nodes.insert(target, node);
                }
            }
        }
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let nodes = self.nodes();
        if !is_root(path) && !matches!(nodes.get(path), Some(Node::Dir { .. })) {
            return Err(not_found(path));
        }
        Ok(nodes
            .iter()
            .filter(|(p, _)| p.parent() == Some(path))
            .map(|(p, n)| DirEntry {
                path: p.clone(),
                is_dir: matches!(n, Node::Dir { .. }),
            })
            .collect())
    }

    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        self.nodes()
            .get(path)
            .map(Node::modified)
            .ok_or_else(|| not_found(path))
    }
}
