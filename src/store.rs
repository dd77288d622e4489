//! Named byte-blob storage consumed by the dispatcher.
//!
//! Provides:
//! - `FileStore`: the list/read/write/remove contract
//! - `DirStore`: flat directory on disk, safe to share between processes
//! - `MemoryStore`: thread-safe in-memory map, for single-process use and tests
//!
//! Neither implementation serializes concurrent operations on the same
//! name beyond what the filesystem or the map lock provides.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, trace};

/// Storage operation errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error("{name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn from_io(name: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound(name.to_string())
        } else {
            StoreError::Io {
                name: name.to_string(),
                source,
            }
        }
    }
}

/// Name to bytes persistence.
pub trait FileStore: Send + Sync {
    /// All stored names.
    fn list(&self) -> Result<Vec<String>, StoreError>;
    fn read(&self, name: &str) -> Result<Vec<u8>, StoreError>;
    /// Store `data` under `name`, replacing any previous contents.
    fn write(&self, name: &str, data: &[u8]) -> Result<(), StoreError>;
    fn remove(&self, name: &str) -> Result<(), StoreError>;
}

/// Reject names that would leave the flat namespace.
fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        Err(StoreError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Files kept as regular files directly under one directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        info!(root = %root.display(), "Opened file store");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

impl FileStore for DirStore {
    fn list(&self) -> Result<Vec<String>, StoreError> {
        let root_name = self.root.display().to_string();
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::from_io(&root_name, e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::from_io(&root_name, e))?;
            let is_file = entry
                .file_type()
                .map_err(|e| StoreError::from_io(&root_name, e))?
                .is_file();
            if !is_file {
                continue;
            }
            // Names that are not UTF-8 cannot be expressed on the wire
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(name)?;
        trace!(name, "Reading file");
        fs::read(path).map_err(|e| StoreError::from_io(name, e))
    }

    fn write(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        trace!(name, bytes = data.len(), "Writing file");
        fs::write(path, data).map_err(|e| StoreError::from_io(name, e))
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        trace!(name, "Removing file");
        fs::remove_file(path).map_err(|e| StoreError::from_io(name, e))
    }
}

/// In-memory store. Contents are not visible across processes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_error(name: &str) -> StoreError {
        StoreError::Io {
            name: name.to_string(),
            source: io::Error::other("store lock poisoned"),
        }
    }
}

impl FileStore for MemoryStore {
    fn list(&self) -> Result<Vec<String>, StoreError> {
        let files = self.files.read().map_err(|_| Self::lock_error("*"))?;
        Ok(files.keys().cloned().collect())
    }

    fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        validate_name(name)?;
        let files = self.files.read().map_err(|_| Self::lock_error(name))?;
        files
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    fn write(&self, name: &str, data: &[u8]) -> Result<(), StoreError> {
        validate_name(name)?;
        let mut files = self.files.write().map_err(|_| Self::lock_error(name))?;
        files.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        validate_name(name)?;
        let mut files = self.files.write().map_err(|_| Self::lock_error(name))?;
        files
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn FileStore) {
        assert!(store.list().unwrap().is_empty());

        store.write("b.txt", b"second").unwrap();
        store.write("a.bin", b"first").unwrap();
        assert_eq!(store.list().unwrap(), vec!["a.bin", "b.txt"]);
        assert_eq!(store.read("a.bin").unwrap(), b"first");

        store.write("a.bin", b"overwritten").unwrap();
        assert_eq!(store.read("a.bin").unwrap(), b"overwritten");

        store.remove("a.bin").unwrap();
        assert!(matches!(store.read("a.bin"), Err(StoreError::NotFound(_))));
        assert!(matches!(store.remove("a.bin"), Err(StoreError::NotFound(_))));
        assert_eq!(store.list().unwrap(), vec!["b.txt"]);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_dir_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&DirStore::open(dir.path()).unwrap());
    }

    #[test]
    fn test_dir_store_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("files");
        let store = DirStore::open(&root).unwrap();
        assert!(root.is_dir());
        assert_eq!(store.root(), root.as_path());
    }

    #[test]
    fn test_dir_store_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        fs::create_dir(dir.path().join("sub.d")).unwrap();
        store.write("x.txt", b"x").unwrap();
        assert_eq!(store.list().unwrap(), vec!["x.txt"]);
    }

    #[test]
    fn test_rejects_path_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path().join("files")).unwrap();
        for name in ["", ".", "..", "../escape.txt", "a/b.txt"] {
            assert!(
                matches!(store.write(name, b"x"), Err(StoreError::InvalidName(_))),
                "{name:?} accepted"
            );
        }
        assert!(!dir.path().join("escape.txt").exists());
    }
}
