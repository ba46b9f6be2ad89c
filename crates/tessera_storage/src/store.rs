//! Named file namespaces.
//!
//! A [`FileStore`] hands out backends by name. Partition files are named
//! deterministically (`<partition>/g000003.log`), so locating a file never
//! requires listing a directory.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::InMemoryBackend;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A namespace of named byte stores.
pub trait FileStore: Send + Sync {
    /// Opens the named file, creating it (empty) if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the file cannot be opened.
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>>;

    /// Returns whether the named file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid.
    fn exists(&self, name: &str) -> StorageResult<bool>;

    /// Removes the named file. Removing a missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    fn remove(&self, name: &str) -> StorageResult<()>;

    /// Atomically replaces the whole content of the named file.
    ///
    /// Readers observe either the previous content or `data`, never a mix.
    ///
    /// # Errors
    ///
    /// Returns an error if the replacement cannot be made durable.
    fn replace(&self, name: &str, data: &[u8]) -> StorageResult<()>;

    /// Reads the whole named file, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    fn read(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        if !self.exists(name)? {
            return Ok(None);
        }
        Ok(Some(self.open(name)?.read_all()?))
    }
}

fn validate_name(name: &str) -> StorageResult<()> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// A [`FileStore`] rooted at a directory on the local file system.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Creates a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the path a name maps to.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid.
    pub fn path_of(&self, name: &str) -> StorageResult<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    #[cfg(unix)]
    fn sync_dir(dir: &Path) -> StorageResult<()> {
        File::open(dir)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_dir(_dir: &Path) -> StorageResult<()> {
        // NTFS journals metadata; directory handles cannot be fsynced.
        Ok(())
    }
}

impl FileStore for DirStore {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        let path = self.path_of(name)?;
        Ok(Box::new(FileBackend::open_with_create_dirs(&path)?))
    }

    fn exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.path_of(name)?.is_file())
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        let path = self.path_of(name)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                if let Some(parent) = path.parent() {
                    Self::sync_dir(parent)?;
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn replace(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.path_of(name)?;
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)?;

        let mut temp = path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        let mut file = File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &path)?;
        Self::sync_dir(&parent)
    }
}

/// A [`FileStore`] that keeps every file in memory.
///
/// Every `open` of the same name returns a handle to the same shared
/// buffer, so data survives dropping and reopening a partition.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    files: Arc<RwLock<HashMap<String, Arc<RwLock<Vec<u8>>>>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the names of all files, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the shared buffer behind a name, if present.
    #[must_use]
    pub fn buffer(&self, name: &str) -> Option<Arc<RwLock<Vec<u8>>>> {
        self.files.read().get(name).cloned()
    }

    /// Creates an independent deep copy of every file.
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        let files = self
            .files
            .read()
            .iter()
            .map(|(name, data)| (name.clone(), Arc::new(RwLock::new(data.read().clone()))))
            .collect();
        Self {
            files: Arc::new(RwLock::new(files)),
        }
    }
}

impl FileStore for MemoryStore {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        validate_name(name)?;
        let shared = Arc::clone(
            self.files
                .write()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(Vec::new()))),
        );
        Ok(Box::new(InMemoryBackend::from_shared(shared)))
    }

    fn exists(&self, name: &str) -> StorageResult<bool> {
        validate_name(name)?;
        Ok(self.files.read().contains_key(name))
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        validate_name(name)?;
        self.files.write().remove(name);
        Ok(())
    }

    fn replace(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        validate_name(name)?;
        self.files
            .write()
            .insert(name.to_string(), Arc::new(RwLock::new(data.to_vec())));
        Ok(())
    }
}
