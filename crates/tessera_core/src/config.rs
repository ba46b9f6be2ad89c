//! Repository configuration.

use crate::checksum::DigestAlgorithm;
use crate::clock::{Clock, SystemClock};
use crate::commit::CommitSource;
use crate::error::{CoreError, CoreResult};
use std::sync::Arc;

/// Configuration for opening a repository.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of element slots in each new log header.
    pub header_capacity: u32,

    /// Fan-in of the state checksum pyramid.
    pub group_size: usize,

    /// Digest algorithm. New partitions use SHA-256 when unset; when set,
    /// opening a partition stored with another algorithm fails.
    pub algorithm: Option<DigestAlgorithm>,

    /// A patch is stored only if its encoding is smaller than this fraction
    /// of the full payload encoding.
    pub patch_ratio: f64,

    /// Whether to sync the log on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Write a snapshot after this many commits in the current generation
    /// (0 = never).
    pub snapshot_after_commits: u32,

    /// Branch name recorded on merge commits made by this replica.
    pub branch: Option<String>,

    /// Source of commit timestamps.
    pub clock: Arc<dyn Clock>,

    /// Where to fetch alternate copies of corrupt commits.
    pub commit_source: Option<Arc<dyn CommitSource>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            header_capacity: 1024,
            group_size: 64,
            algorithm: None,
            patch_ratio: 0.5,
            sync_on_commit: true,
            snapshot_after_commits: 0, // disabled
            branch: None,
            clock: Arc::new(SystemClock),
            commit_source: None,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the header slot capacity for new log files.
    #[must_use]
    pub const fn header_capacity(mut self, capacity: u32) -> Self {
        self.header_capacity = capacity;
        self
    }

    /// Sets the checksum pyramid fan-in.
    #[must_use]
    pub const fn group_size(mut self, size: usize) -> Self {
        self.group_size = size;
        self
    }

    /// Requires a digest algorithm, for new and existing partitions.
    #[must_use]
    pub const fn algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    /// Sets the patch size threshold.
    #[must_use]
    pub fn patch_ratio(mut self, ratio: f64) -> Self {
        self.patch_ratio = ratio;
        self
    }

    /// Sets whether to sync the log on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the automatic snapshot threshold.
    #[must_use]
    pub const fn snapshot_after_commits(mut self, commits: u32) -> Self {
        self.snapshot_after_commits = commits;
        self
    }

    /// Sets the branch name used for merge commits.
    #[must_use]
    pub fn branch(mut self, name: impl Into<String>) -> Self {
        self.branch = Some(name.into());
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the alternate-copy provider for corrupt commits.
    #[must_use]
    pub fn commit_source(mut self, source: Arc<dyn CommitSource>) -> Self {
        self.commit_source = Some(source);
        self
    }

    /// Checks that the values are usable.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first bad value.
    pub fn validate(&self) -> CoreResult<()> {
        if self.header_capacity == 0 {
            return Err(CoreError::configuration("header_capacity must be at least 1"));
        }
        if self.group_size < 2 {
            return Err(CoreError::configuration("group_size must be at least 2"));
        }
        if !(self.patch_ratio > 0.0 && self.patch_ratio <= 1.0) {
            return Err(CoreError::configuration(format!(
                "patch_ratio must be in (0, 1], got {}",
                self.patch_ratio
            )));
        }
        if let Some(branch) = &self.branch {
            if branch.is_empty() || branch.len() > usize::from(u16::MAX) {
                return Err(CoreError::configuration("branch name must be 1-65535 bytes"));
            }
        }
        Ok(())
    }
}
