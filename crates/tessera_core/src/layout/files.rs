//! Generation bookkeeping for one partition's file set.
//!
//! A generation is a snapshot file plus the log that continues it. The
//! `CURRENT` file names the active generation and is only ever replaced
//! atomically, which makes it the publish point for new snapshots and
//! compacted histories.

use crate::addressing::FileNames;
use crate::error::{CoreError, CoreResult};
use std::sync::Arc;
use tessera_storage::{FileStore, StorageBackend};

/// Access to the files of one partition.
#[derive(Clone)]
pub struct PartitionFiles {
    store: Arc<dyn FileStore>,
    names: FileNames,
}

impl std::fmt::Debug for PartitionFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionFiles")
            .field("current", &self.names.current())
            .finish_non_exhaustive()
    }
}

impl PartitionFiles {
    /// Files named by `names` inside `store`.
    #[must_use]
    pub fn new(store: Arc<dyn FileStore>, names: FileNames) -> Self {
        Self { store, names }
    }

    /// Returns the naming scheme.
    #[must_use]
    pub fn names(&self) -> &FileNames {
        &self.names
    }

    /// Reads the current generation, or `None` if the partition does not
    /// exist.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if `CURRENT` does not hold a number.
    pub fn current(&self) -> CoreResult<Option<u64>> {
        let Some(bytes) = self.store.read(&self.names.current())? else {
            return Ok(None);
        };
        let text = std::str::from_utf8(&bytes)
            .map_err(|_| CoreError::invalid_format("CURRENT is not UTF-8"))?;
        text.trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| CoreError::invalid_format(format!("CURRENT holds {text:?}")))
    }

    /// Atomically points `CURRENT` at `generation`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the replacement fails.
    pub fn publish(&self, generation: u64) -> CoreResult<()> {
        let text = format!("{generation}\n");
        self.store.replace(&self.names.current(), text.as_bytes())?;
        Ok(())
    }

    /// Returns true if both files of `generation` exist.
    ///
    /// # Errors
    ///
    /// Returns a storage error if existence cannot be checked.
    pub fn has_generation(&self, generation: u64) -> CoreResult<bool> {
        Ok(self.store.exists(&self.names.snapshot(generation))?
            && self.store.exists(&self.names.log(generation))?)
    }

    /// Returns the retained generations older than `current`, newest first.
    ///
    /// Superseded generations are only ever deleted oldest-first as a
    /// contiguous range, so the walk stops at the first gap.
    ///
    /// # Errors
    ///
    /// Returns a storage error if existence cannot be checked.
    pub fn older_generations(&self, current: u64) -> CoreResult<Vec<u64>> {
        let mut out = Vec::new();
        let mut generation = current;
        while generation > 0 {
            generation -= 1;
            if !self.has_generation(generation)? {
                break;
            }
            out.push(generation);
        }
        Ok(out)
    }

    /// Reads a snapshot file.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the file is missing.
    pub fn read_snapshot(&self, generation: u64) -> CoreResult<Vec<u8>> {
        let name = self.names.snapshot(generation);
        self.store
            .read(&name)?
            .ok_or_else(|| CoreError::not_found(name))
    }

    /// Writes a snapshot file.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails.
    pub fn write_snapshot(&self, generation: u64, bytes: &[u8]) -> CoreResult<()> {
        self.store.replace(&self.names.snapshot(generation), bytes)?;
        Ok(())
    }

    /// Opens (creating if needed) the log of `generation`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the file cannot be opened.
    pub fn open_log(&self, generation: u64) -> CoreResult<Box<dyn StorageBackend>> {
        Ok(self.store.open(&self.names.log(generation))?)
    }

    /// Opens an existing log of `generation`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the log does not exist.
    pub fn open_existing_log(&self, generation: u64) -> CoreResult<Box<dyn StorageBackend>> {
        let name = self.names.log(generation);
        if !self.store.exists(&name)? {
            return Err(CoreError::not_found(name));
        }
        self.open_log(generation)
    }

    /// Deletes both files of `generation`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a file exists but cannot be removed.
    pub fn remove_generation(&self, generation: u64) -> CoreResult<()> {
        self.store.remove(&self.names.log(generation))?;
        self.store.remove(&self.names.snapshot(generation))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartitionId;
    use tessera_storage::MemoryStore;

    fn files() -> (MemoryStore, PartitionFiles) {
        let store = MemoryStore::new();
        let names = FileNames::for_partition(&PartitionId::new("inbox").unwrap());
        (store.clone(), PartitionFiles::new(Arc::new(store), names))
    }

    #[test]
    fn current_round_trip() {
        let (_, files) = files();
        assert_eq!(files.current().unwrap(), None);
        files.publish(3).unwrap();
        assert_eq!(files.current().unwrap(), Some(3));
    }

    #[test]
    fn garbage_current_is_invalid_format() {
        let (store, files) = files();
        store.replace("inbox/CURRENT", b"three").unwrap();
        assert!(matches!(
            files.current(),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn older_generations_stop_at_gap() {
        let (_, files) = files();
        for g in 0..4 {
            files.write_snapshot(g, b"s").unwrap();
            files.open_log(g).unwrap();
        }
        files.remove_generation(1).unwrap();
        assert_eq!(files.older_generations(3).unwrap(), vec![2]);
        assert_eq!(files.older_generations(0).unwrap(), Vec::<u64>::new());
    }
}
