//! Error types for Tessera core.

use crate::checksum::{Digest, DigestAlgorithm};
use crate::commit::RejectedChange;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Tessera core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] tessera_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A payload or patch could not be serialized or deserialized.
    #[error("encoding error: {message}")]
    Encoding {
        /// Description of the failure.
        message: String,
    },

    /// Bytes do not follow the expected file format.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// A caller-supplied argument is invalid.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// Unknown partition, element or commit.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// The header of the active generation has no free slot for a new element.
    #[error("header full: partition {partition} already tracks {capacity} elements")]
    HeaderFull {
        /// Partition whose header is exhausted.
        partition: String,
        /// Fixed slot capacity of the header.
        capacity: u32,
    },

    /// An append could not be made durable, even after one retry.
    #[error("append to partition {partition} failed: {message}")]
    AppendFailed {
        /// Partition being appended to.
        partition: String,
        /// Description of the underlying failure.
        message: String,
    },

    /// A commit's stored id does not match its content.
    #[error("corrupt commit {commit_id}: {message}")]
    CorruptCommit {
        /// The id stored in the damaged record.
        commit_id: Digest,
        /// Description of the damage.
        message: String,
    },

    /// A snapshot's digest or state checksum does not match its content.
    #[error("corrupt snapshot in generation {generation}: {message}")]
    CorruptSnapshot {
        /// Generation the snapshot belongs to.
        generation: u64,
        /// Description of the damage.
        message: String,
    },

    /// Two heads share no ancestor in the locally known history.
    #[error("no common ancestor between {a} and {b}")]
    NoCommonAncestor {
        /// First head.
        a: Digest,
        /// Second head.
        b: Digest,
    },

    /// A file or commit uses a different digest algorithm than the partition.
    #[error("digest algorithm mismatch: expected {expected}, found {found}")]
    AlgorithmMismatch {
        /// Algorithm required by the partition or configuration.
        expected: DigestAlgorithm,
        /// Algorithm encountered.
        found: DigestAlgorithm,
    },

    /// A merge rejected candidate values.
    #[error("merge rejected {} element(s)", rejected.len())]
    MergeConflict {
        /// Rejected elements with both candidate values.
        rejected: Vec<RejectedChange>,
    },

    /// No classifier matched and no fallback classifier is registered.
    #[error("no classifier matched and no fallback classifier is registered")]
    NoMatchingClassifier,

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// A commit was built on a parent that is no longer the partition head.
    #[error("stale parent: partition head is {head}, commit names {given}")]
    StaleParent {
        /// Current head (or "none").
        head: String,
        /// Parent supplied by the caller (or "none").
        given: String,
    },

    /// A long-running operation was cancelled before publishing.
    #[error("operation cancelled")]
    Cancelled,

    /// Another process holds the repository lock.
    #[error("repository locked: another process has exclusive access")]
    RepositoryLocked,
}

impl CoreError {
    /// Creates an encoding error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a corrupt commit error.
    pub fn corrupt_commit(commit_id: Digest, message: impl Into<String>) -> Self {
        Self::CorruptCommit {
            commit_id,
            message: message.into(),
        }
    }

    /// Creates a corrupt snapshot error.
    pub fn corrupt_snapshot(generation: u64, message: impl Into<String>) -> Self {
        Self::CorruptSnapshot {
            generation,
            message: message.into(),
        }
    }

    /// Creates an append failed error.
    pub fn append_failed(partition: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AppendFailed {
            partition: partition.into(),
            message: message.into(),
        }
    }

    /// Returns true for checksum-class failures (corrupt commits or snapshots).
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptCommit { .. } | Self::CorruptSnapshot { .. }
        )
    }
}
