//! Commit/history engine.
//!
//! A commit is an immutable record of item changes. Its id is the digest of
//! its serialized record and covers every other field. Replaying the commits
//! on a partition's first-parent line, from a snapshot base forward,
//! reconstructs the partition state.

mod history;
mod record;
mod state;

pub use history::CommitGraph;
pub use record::{
    ChangeKind, ChangeTag, Commit, CommitDraft, CommitId, ItemChange, ParsedCommit,
    RejectedChange, COMMIT_MAGIC, COMMIT_VERSION, MAX_PARENTS,
};
pub use state::{encode_update, Entry, State, Status, Tombstone, TrackedState};

use crate::types::{ElementId, PartitionId};
use crate::payload::Payload;
use std::fmt;

/// Provides alternate copies of commits, typically from a replica.
///
/// Consulted when a locally stored commit fails its id check. Returned
/// bytes are only used if they verify against the requested id.
pub trait CommitSource: fmt::Debug + Send + Sync {
    /// Returns the serialized record of `id` in `partition`, if available.
    fn fetch(&self, partition: &PartitionId, id: &CommitId) -> Option<Vec<u8>>;
}

/// A requested change to one element, as supplied by callers of `append`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Create or replace the element's payload.
    Put(ElementId, Payload),
    /// Remove the element.
    Delete(ElementId),
}

impl Change {
    /// Returns the element this change targets.
    #[must_use]
    pub fn element(&self) -> ElementId {
        match self {
            Self::Put(id, _) | Self::Delete(id) => *id,
        }
    }
}
