//! Crash simulation for Tessera.
//!
//! A [`CrashableStore`] wraps a [`MemoryStore`] and lets a fixed number of
//! mutating operations through. The operation that exhausts the budget is
//! torn (an append writes half its bytes) and everything after it fails,
//! as if the process died at that point. The bytes that reached the inner
//! store are what a restarted process would find on disk.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tessera_testkit::crash::CrashableStore;
//!
//! let store = CrashableStore::new(MemoryStore::new());
//! store.crash_after(3);
//! // ... run an operation against `store`, then reopen from `store.disk()`
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tessera_storage::{FileStore, MemoryStore, StorageBackend, StorageError, StorageResult};

/// Shared crash budget of a store and every backend it opened.
#[derive(Debug, Default)]
struct CrashState {
    /// Mutating operations still allowed; `usize::MAX` means unlimited.
    remaining: AtomicUsize,
    /// Mutating operations performed so far.
    performed: AtomicUsize,
    crashed: AtomicBool,
}

impl CrashState {
    fn new() -> Self {
        Self {
            remaining: AtomicUsize::new(usize::MAX),
            performed: AtomicUsize::new(0),
            crashed: AtomicBool::new(false),
        }
    }

    /// Accounts for one mutating operation. Returns `Ok(true)` if it may
    /// run in full, `Ok(false)` if it is the torn one, or an error once
    /// crashed.
    fn admit(&self) -> StorageResult<bool> {
        if self.crashed.load(Ordering::SeqCst) {
            return Err(crash_error("write after simulated crash"));
        }
        self.performed.fetch_add(1, Ordering::SeqCst);
        let remaining = self.remaining.load(Ordering::SeqCst);
        if remaining == usize::MAX {
            return Ok(true);
        }
        if remaining == 0 {
            self.crashed.store(true, Ordering::SeqCst);
            return Ok(false);
        }
        self.remaining.store(remaining - 1, Ordering::SeqCst);
        Ok(true)
    }

    fn check_alive(&self) -> StorageResult<()> {
        if self.crashed.load(Ordering::SeqCst) {
            Err(crash_error("sync after simulated crash"))
        } else {
            Ok(())
        }
    }
}

fn crash_error(message: &str) -> StorageError {
    StorageError::Io(std::io::Error::other(message.to_string()))
}

/// A storage backend wrapper that can simulate crashes.
pub struct CrashableBackend {
    inner: Box<dyn StorageBackend>,
    state: Arc<CrashState>,
}

impl CrashableBackend {
    /// Wraps a backend with an unlimited budget of its own.
    pub fn new(inner: Box<dyn StorageBackend>) -> Self {
        Self {
            inner,
            state: Arc::new(CrashState::new()),
        }
    }

    /// Lets `operations` more mutating operations through, then crashes.
    pub fn crash_after(&self, operations: usize) {
        self.state.remaining.store(operations, Ordering::SeqCst);
    }

    /// Returns whether the backend has crashed.
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        if self.state.admit()? {
            return self.inner.append(data);
        }
        // Torn write: only the first half reaches the disk.
        let partial = data.len() / 2;
        if partial > 0 {
            let _ = self.inner.append(&data[..partial]);
        }
        Err(crash_error("simulated crash during append"))
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if self.state.admit()? {
            return self.inner.write_at(offset, data);
        }
        Err(crash_error("simulated crash during overwrite"))
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.state.check_alive()?;
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.state.check_alive()?;
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        if self.state.admit()? {
            return self.inner.truncate(new_size);
        }
        Err(crash_error("simulated crash during truncate"))
    }
}

/// A file store whose backends share one crash budget.
#[derive(Clone)]
pub struct CrashableStore {
    inner: MemoryStore,
    state: Arc<CrashState>,
}

impl CrashableStore {
    /// Wraps a memory store with an unlimited budget.
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            state: Arc::new(CrashState::new()),
        }
    }

    /// Lets `operations` more mutating operations through, then crashes.
    pub fn crash_after(&self, operations: usize) {
        self.state.remaining.store(operations, Ordering::SeqCst);
    }

    /// Returns whether the simulated crash happened.
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }

    /// Returns the number of mutating operations performed so far.
    pub fn operations(&self) -> usize {
        self.state.performed.load(Ordering::SeqCst)
    }

    /// Returns a frozen copy of the bytes that reached the disk.
    pub fn disk(&self) -> MemoryStore {
        self.inner.deep_clone()
    }
}

impl FileStore for CrashableStore {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        let inner = self.inner.open(name)?;
        Ok(Box::new(CrashableBackend {
            inner,
            state: self.state.clone(),
        }))
    }

    fn exists(&self, name: &str) -> StorageResult<bool> {
        self.inner.exists(name)
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        if self.state.admit()? {
            return self.inner.remove(name);
        }
        Err(crash_error("simulated crash during remove"))
    }

    fn replace(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        // Replacement is atomic: a crash leaves the old contents.
        if self.state.admit()? {
            return self.inner.replace(name, data);
        }
        Err(crash_error("simulated crash during replace"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_storage::InMemoryBackend;

    #[test]
    fn backend_tears_the_crashing_append() {
        let mut backend = CrashableBackend::new(Box::new(InMemoryBackend::new()));
        backend.append(b"abcd").unwrap();
        backend.crash_after(0);
        assert!(backend.append(b"efgh").is_err());
        assert!(backend.has_crashed());
        assert_eq!(backend.size().unwrap(), 6);
        assert!(backend.append(b"ij").is_err());
        assert!(backend.sync().is_err());
    }

    #[test]
    fn store_budget_is_shared() {
        let store = CrashableStore::new(MemoryStore::new());
        let mut a = store.open("a").unwrap();
        let mut b = store.open("b").unwrap();
        store.crash_after(1);
        a.append(b"1").unwrap();
        assert!(b.append(b"2").is_err());
        assert!(store.replace("c", b"3").is_err());
        assert!(store.has_crashed());
        assert!(!store.disk().exists("c").unwrap());
        assert_eq!(store.operations(), 2);
    }
}
