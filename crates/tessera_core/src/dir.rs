//! Repository directory management.
//!
//! ```text
//! <repo_path>/
//! ├─ LOCK              # Advisory lock for single-writer
//! ├─ inbox/            # One directory per partition
//! │  ├─ CURRENT
//! │  ├─ g000000.snap
//! │  └─ g000000.log
//! └─ archive/
//! ```
//!
//! The LOCK file ensures only one process writes to the repository at a
//! time. Partition files are addressed by name through a [`DirStore`].

use crate::error::{CoreError, CoreResult};
use crate::types::PartitionId;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tessera_storage::DirStore;

const LOCK_FILE: &str = "LOCK";
const CURRENT_FILE: &str = "CURRENT";

/// An open repository directory holding the writer lock.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct RepoDir {
    path: PathBuf,
    _lock_file: File,
}

impl RepoDir {
    /// Opens or creates a repository directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns `RepositoryLocked` if another process holds the lock,
    /// `InvalidFormat` if the path is missing (and `create_if_missing` is
    /// false) or not a directory, or an I/O error.
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "repository directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::RepositoryLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the repository path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a file store rooted at the repository.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the root cannot be used.
    pub fn store(&self) -> CoreResult<DirStore> {
        Ok(DirStore::new(&self.path)?)
    }

    /// Lists the partitions that have a `CURRENT` file, in name order.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be read.
    pub fn partitions(&self) -> CoreResult<Vec<PartitionId>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || !entry.path().join(CURRENT_FILE).exists() {
                continue;
            }
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| PartitionId::new(name).ok())
            {
                out.push(id);
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("new_repo");
        let dir = RepoDir::open(&path, true).unwrap();
        assert!(path.is_dir());
        assert_eq!(dir.path(), path);
    }

    #[test]
    fn open_fails_if_not_exists_and_no_create() {
        let temp = tempdir().unwrap();
        assert!(RepoDir::open(&temp.path().join("missing"), false).is_err());
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let _first = RepoDir::open(temp.path(), true).unwrap();
        assert!(matches!(
            RepoDir::open(temp.path(), true),
            Err(CoreError::RepositoryLocked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        drop(RepoDir::open(temp.path(), true).unwrap());
        RepoDir::open(temp.path(), true).unwrap();
    }

    #[test]
    fn partitions_need_current() {
        let temp = tempdir().unwrap();
        let dir = RepoDir::open(temp.path(), true).unwrap();
        fs::create_dir(temp.path().join("inbox")).unwrap();
        fs::write(temp.path().join("inbox").join(CURRENT_FILE), b"0\n").unwrap();
        fs::create_dir(temp.path().join("stray")).unwrap();
        let names: Vec<String> = dir
            .partitions()
            .unwrap()
            .into_iter()
            .map(|p| p.to_string())
            .collect();
        assert_eq!(names, vec!["inbox"]);
    }
}
