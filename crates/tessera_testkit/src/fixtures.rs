//! Test fixtures and repository helpers.
//!
//! Provides convenience functions for setting up test repositories
//! and common test scenarios.

use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tessera_core::{Config, ManualClock, PartitionId, Payload, Repository, Timestamp};
use tessera_storage::MemoryStore;

/// Start time of every fixture clock.
pub const FIXTURE_EPOCH: Timestamp = Timestamp::from_millis(1_700_000_000_000);

/// A test repository with a manual clock and automatic cleanup.
pub struct TestRepo {
    /// The repository instance.
    pub repo: Repository,
    /// The clock stamped on every commit.
    pub clock: Arc<ManualClock>,
    config: Config,
    store: Option<MemoryStore>,
    temp_dir: Option<TempDir>,
}

impl TestRepo {
    /// Creates an in-memory repository with a fallback partition `inbox`.
    pub fn memory() -> Self {
        Self::memory_with(|config| config)
    }

    /// Creates an in-memory repository with an adjusted configuration.
    pub fn memory_with(adjust: impl FnOnce(Config) -> Config) -> Self {
        let clock = Arc::new(ManualClock::new(FIXTURE_EPOCH));
        let config = adjust(Config::new().clock(clock.clone()).sync_on_commit(false));
        let store = MemoryStore::new();
        let repo = Repository::with_store(Arc::new(store.clone()), config.clone())
            .expect("Failed to open in-memory repository");
        repo.set_fallback(inbox());
        Self {
            repo,
            clock,
            config,
            store: Some(store),
            temp_dir: None,
        }
    }

    /// Creates a repository in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let clock = Arc::new(ManualClock::new(FIXTURE_EPOCH));
        let config = Config::new().clock(clock.clone());
        let repo = Repository::open_with_config(temp_dir.path(), config.clone())
            .expect("Failed to open file repository");
        repo.set_fallback(inbox());
        Self {
            repo,
            clock,
            config,
            store: None,
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the repository directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }

    /// Returns the backing store if in-memory.
    pub fn store(&self) -> Option<&MemoryStore> {
        self.store.as_ref()
    }

    /// Drops every open partition and opens the repository again from the
    /// same files, as after a restart.
    pub fn reopen(self) -> Self {
        let Self {
            repo,
            clock,
            config,
            store,
            temp_dir,
        } = self;
        drop(repo);
        let repo = match (&store, &temp_dir) {
            (Some(store), _) => Repository::with_store(Arc::new(store.clone()), config.clone()),
            (None, Some(dir)) => Repository::open_with_config(dir.path(), config.clone()),
            (None, None) => unreachable!("fixture has neither store nor directory"),
        }
        .expect("Failed to reopen repository");
        repo.set_fallback(inbox());
        Self {
            repo,
            clock,
            config,
            store,
            temp_dir,
        }
    }
}

impl std::ops::Deref for TestRepo {
    type Target = Repository;

    fn deref(&self) -> &Self::Target {
        &self.repo
    }
}

/// Runs a test with a temporary in-memory repository.
///
/// # Example
///
/// ```rust,ignore
/// use tessera_testkit::with_temp_repo;
///
/// #[test]
/// fn my_test() {
///     with_temp_repo(|repo| {
///         repo.insert(message("hello")).unwrap();
///     });
/// }
/// ```
pub fn with_temp_repo<F, R>(f: F) -> R
where
    F: FnOnce(&Repository) -> R,
{
    let test_repo = TestRepo::memory();
    f(&test_repo.repo)
}

/// Runs a test with a repository in a temporary directory.
pub fn with_file_repo<F, R>(f: F) -> R
where
    F: FnOnce(&Repository, &Path) -> R,
{
    let test_repo = TestRepo::file();
    let path = test_repo
        .path()
        .expect("File repository should have a path")
        .to_path_buf();
    f(&test_repo.repo, &path)
}

/// The fallback partition of every fixture.
pub fn inbox() -> PartitionId {
    PartitionId::new("inbox").expect("valid partition id")
}

/// Shorthand for a valid partition id.
pub fn partition(name: &str) -> PartitionId {
    PartitionId::new(name).expect("valid partition id")
}

/// A mail-like payload.
pub fn message(subject: &str) -> Payload {
    Payload::new()
        .with("subject", subject)
        .with("from", "alice@example.com")
        .with("body", "The quick brown fox jumps over the lazy dog.")
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use tessera_core::ElementId;

    /// Creates a repository whose `inbox` holds `count` messages, one
    /// commit each, one second apart.
    pub fn populated_repo(count: usize) -> (TestRepo, Vec<ElementId>) {
        let test_repo = TestRepo::memory();
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let (_, id, _) = test_repo
                .insert(message(&format!("message {i}")))
                .expect("Failed to insert message");
            ids.push(id);
            test_repo.clock.advance(Timestamp::SECOND);
        }
        (test_repo, ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_repo_routes_to_inbox() {
        let test_repo = TestRepo::memory();
        let (partition, _, _) = test_repo.insert(message("hi")).unwrap();
        assert_eq!(partition, inbox());
    }

    #[test]
    fn reopen_keeps_state() {
        let (test_repo, ids) = scenarios::populated_repo(3);
        let checksum = test_repo.state_checksum(&inbox()).unwrap();
        let test_repo = test_repo.reopen();
        assert_eq!(test_repo.state_checksum(&inbox()).unwrap(), checksum);
        assert_eq!(test_repo.read_state(&inbox()).unwrap().len(), ids.len());
    }

    #[test]
    fn file_repo_reopens() {
        let test_repo = TestRepo::file();
        test_repo.insert(message("kept")).unwrap();
        let test_repo = test_repo.reopen();
        assert_eq!(test_repo.read_state(&inbox()).unwrap().len(), 1);
    }
}
