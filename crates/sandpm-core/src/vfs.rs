//! Filesystem collaborator used by the package manager.
//!
//! The package manager never touches the host filesystem directly. It reads
//! manifests and writes `node_modules` through [`VirtualFs`], which the
//! sandbox supplies. Two implementations ship here: [`MemoryFs`] for fully
//! virtual containers and tests, and [`DiskFs`] which maps the virtual tree
//! under a host directory.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// Byte-oriented filesystem API consumed by the installer and facade.
pub trait VirtualFs: Send + Sync + fmt::Debug {
    /// Read a whole file.
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Create or replace a file. The parent directory must exist.
    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Create a directory, optionally with all missing ancestors.
    fn mkdir(&self, path: &Path, recursive: bool) -> io::Result<()>;

    /// List the entry names directly under a directory, sorted.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Whether a file or directory exists at `path`.
    fn exists(&self, path: &Path) -> bool;
}

/// Normalize a virtual path to an absolute path without `.` or `..`.
///
/// Relative paths are interpreted from the virtual root.
pub fn normalize_path(path: &Path) -> io::Result<PathBuf> {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
            Component::Prefix(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("path prefixes are not supported: {}", path.display()),
                ));
            }
        }
    }
    Ok(out)
}

#[derive(Debug)]
struct MemoryTree {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
    /// Writes under any of these prefixes fail with `PermissionDenied`.
    read_only: Vec<PathBuf>,
}

impl Default for MemoryTree {
    fn default() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert(PathBuf::from("/"));
        Self {
            files: BTreeMap::new(),
            dirs,
            read_only: Vec::new(),
        }
    }
}

impl MemoryTree {
    fn check_writable(&self, path: &Path) -> io::Result<()> {
        if self.read_only.iter().any(|prefix| path.starts_with(prefix)) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("read-only location: {}", path.display()),
            ));
        }
        Ok(())
    }

    fn require_parent_dir(&self, path: &Path) -> io::Result<()> {
        let parent = path.parent().unwrap_or(Path::new("/"));
        if self.dirs.contains(parent) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such directory: {}", parent.display()),
            ))
        }
    }
}

/// In-memory filesystem.
#[derive(Debug, Default)]
pub struct MemoryFs {
    tree: RwLock<MemoryTree>,
}

impl MemoryFs {
    /// Create an empty filesystem containing only `/`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write under `prefix` fail with `PermissionDenied`.
    pub fn fail_writes_under(&self, prefix: impl AsRef<Path>) -> io::Result<()> {
        let prefix = normalize_path(prefix.as_ref())?;
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        tree.read_only.push(prefix);
        Ok(())
    }

    /// All file paths currently stored, sorted.
    #[must_use]
    pub fn file_paths(&self) -> Vec<PathBuf> {
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        tree.files.keys().cloned().collect()
    }
}

impl VirtualFs for MemoryFs {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        let path = normalize_path(path)?;
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        tree.files.get(&path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such file: {}", path.display()),
            )
        })
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let path = normalize_path(path)?;
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        tree.check_writable(&path)?;
        tree.require_parent_dir(&path)?;
        if tree.dirs.contains(&path) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("is a directory: {}", path.display()),
            ));
        }
        tree.files.insert(path, contents.to_vec());
        Ok(())
    }

    fn mkdir(&self, path: &Path, recursive: bool) -> io::Result<()> {
        let path = normalize_path(path)?;
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        tree.check_writable(&path)?;

        if tree.files.contains_key(&path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("file exists: {}", path.display()),
            ));
        }

        if !recursive {
            if tree.dirs.contains(&path) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("directory exists: {}", path.display()),
                ));
            }
            tree.require_parent_dir(&path)?;
            tree.dirs.insert(path);
            return Ok(());
        }

        let ancestors: Vec<PathBuf> = path.ancestors().map(Path::to_path_buf).collect();
        for dir in ancestors.into_iter().rev() {
            if tree.files.contains_key(&dir) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("file in the way: {}", dir.display()),
                ));
            }
            tree.dirs.insert(dir);
        }
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let path = normalize_path(path)?;
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        if !tree.dirs.contains(&path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such directory: {}", path.display()),
            ));
        }

        let child_name = |p: &PathBuf| -> Option<String> {
            (p.parent() == Some(path.as_path()))
                .then(|| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .flatten()
        };
        let names: BTreeSet<String> = tree
            .dirs
            .iter()
            .chain(tree.files.keys())
            .filter_map(child_name)
            .collect();
        Ok(names.into_iter().collect())
    }

    fn exists(&self, path: &Path) -> bool {
        let Ok(path) = normalize_path(path) else {
            return false;
        };
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        tree.dirs.contains(&path) || tree.files.contains_key(&path)
    }
}

/// Filesystem that maps the virtual tree under a host directory.
///
/// Virtual `/app/package.json` lives at `<root>/app/package.json`. Files are
/// written atomically.
#[derive(Debug, Clone)]
pub struct DiskFs {
    root: PathBuf,
}

impl DiskFs {
    /// Create a filesystem rooted at `root` on the host.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Host directory backing the virtual root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, path: &Path) -> io::Result<PathBuf> {
        let normalized = normalize_path(path)?;
        let relative = normalized.strip_prefix("/").unwrap_or(&normalized);
        Ok(self.root.join(relative))
    }
}

impl VirtualFs for DiskFs {
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(self.host_path(path)?)
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let host = self.host_path(path)?;
        if let Some(parent) = host.parent() {
            if !parent.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no such directory: {}", parent.display()),
                ));
            }
        }
        sandpm_util::fs::atomic_write(&host, contents)
    }

    fn mkdir(&self, path: &Path, recursive: bool) -> io::Result<()> {
        let host = self.host_path(path)?;
        if recursive {
            fs::create_dir_all(host)
        } else {
            fs::create_dir(host)
        }
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir(self.host_path(path)?)?
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }

    fn exists(&self, path: &Path) -> bool {
        self.host_path(path).is_ok_and(|p| p.exists())
    }
}
