//! Three-way merge of two branch states.
//!
//! The planner compares every element's status on the local branch, the
//! remote branch and their nearest common ancestor:
//!
//! - unchanged on the remote side: the local status stays;
//! - changed only on the remote side: the remote status is taken;
//! - changed on both sides to the same status: accepted as is;
//! - changed on both sides differently: the resolver decides.
//!
//! A move away from the partition is never conflicted: if either side
//! moved the element, the move stands and a differing edit on the other
//! side is recorded as rejected. Rejected candidates are stored on the
//! merge commit so they can be audited or re-applied later.

use crate::checksum::{item_checksum, DigestAlgorithm};
use crate::commit::{CommitId, Entry, RejectedChange, State, Status};
use crate::error::{CoreError, CoreResult};
use crate::payload::Payload;
use crate::types::{ElementId, Timestamp};
use std::collections::BTreeSet;

/// One branch's view of a conflicting element.
#[derive(Debug, Clone, Copy)]
pub struct MergeSide<'a> {
    /// The element's payload on this branch, `None` if absent or moved.
    pub value: Option<&'a Payload>,
    /// Timestamp of the branch head.
    pub head_timestamp: Timestamp,
    /// The branch head.
    pub head: CommitId,
}

/// A resolver's decision for one conflicting element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Store this payload.
    Accept(Payload),
    /// Remove the element.
    Delete,
    /// Keep the local status and record both candidates as rejected.
    Reject,
}

/// The tip of one branch taking part in a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchHead {
    /// Head commit.
    pub head: CommitId,
    /// Timestamp of the head commit.
    pub timestamp: Timestamp,
}

impl BranchHead {
    fn side<'a>(&self, status: &'a Status) -> MergeSide<'a> {
        MergeSide {
            value: status.payload(),
            head_timestamp: self.timestamp,
            head: self.head,
        }
    }
}

/// Picks the side whose branch head is newer; ties go to the local side.
pub fn last_writer_wins(
    _element: ElementId,
    _ancestor: Option<&Payload>,
    local: &MergeSide<'_>,
    remote: &MergeSide<'_>,
) -> Resolution {
    let winner = if remote.head_timestamp > local.head_timestamp {
        remote
    } else {
        local
    };
    match winner.value {
        Some(payload) => Resolution::Accept(payload.clone()),
        None => Resolution::Delete,
    }
}

/// Always keeps the local value.
pub fn prefer_local(
    _element: ElementId,
    _ancestor: Option<&Payload>,
    local: &MergeSide<'_>,
    _remote: &MergeSide<'_>,
) -> Resolution {
    match local.value {
        Some(payload) => Resolution::Accept(payload.clone()),
        None => Resolution::Delete,
    }
}

/// Rejects every conflict, leaving the local value in place.
pub fn reject_all(
    _element: ElementId,
    _ancestor: Option<&Payload>,
    _local: &MergeSide<'_>,
    _remote: &MergeSide<'_>,
) -> Resolution {
    Resolution::Reject
}

/// The merged state and the candidates that did not make it in.
#[derive(Debug, Clone)]
pub struct MergePlan {
    /// State the merge commit produces.
    pub state: State,
    /// Conflicts the resolver rejected, or edits overridden by a move.
    pub rejected: Vec<RejectedChange>,
}

/// Result of a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The merge commit, or the unchanged head if nothing needed merging.
    pub commit_id: CommitId,
    /// Candidates recorded as rejected on the merge commit.
    pub rejected: Vec<RejectedChange>,
}

impl MergeOutcome {
    /// Returns true if no candidate was rejected.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }

    /// Turns rejections into an error for callers that treat them as fatal.
    ///
    /// # Errors
    ///
    /// Returns `MergeConflict` listing the rejected candidates.
    pub fn ensure_clean(self) -> CoreResult<CommitId> {
        if self.rejected.is_empty() {
            Ok(self.commit_id)
        } else {
            Err(CoreError::MergeConflict {
                rejected: self.rejected,
            })
        }
    }
}

/// Branch tag recorded on a merge commit when the replica has no name of
/// its own.
#[must_use]
pub fn merge_branch_name(algorithm: DigestAlgorithm, local: &CommitId, remote: &CommitId) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(local.as_bytes());
    hasher.update(remote.as_bytes());
    format!("merge-{}", hasher.finalize().short())
}

/// Computes the merged state of `local` and `remote` over `ancestor`.
///
/// # Errors
///
/// Returns an encoding error if an accepted payload cannot be serialized.
pub fn plan<F>(
    algorithm: DigestAlgorithm,
    ancestor: &State,
    local: (&State, BranchHead),
    remote: (&State, BranchHead),
    resolve: F,
) -> CoreResult<MergePlan>
where
    F: Fn(ElementId, Option<&Payload>, &MergeSide<'_>, &MergeSide<'_>) -> Resolution,
{
    let (local_state, local_head) = local;
    let (remote_state, remote_head) = remote;

    let ids: BTreeSet<ElementId> = [ancestor, local_state, remote_state]
        .into_iter()
        .flat_map(|s| s.iter().map(|(id, _)| *id).chain(s.moved().map(|(id, _)| *id)))
        .collect();

    let mut state = local_state.clone();
    let mut rejected = Vec::new();

    for id in ids {
        let base = ancestor.status(&id);
        let ours = local_state.status(&id);
        let theirs = remote_state.status(&id);
        if ours == theirs || theirs == base {
            continue;
        }
        if ours == base {
            state.set_status(id, theirs);
            continue;
        }

        let record = |rejected: &mut Vec<RejectedChange>| {
            rejected.push(RejectedChange {
                element: id,
                local: ours.payload().cloned(),
                remote: theirs.payload().cloned(),
            });
        };

        match (&ours, &theirs) {
            (Status::Moved(_), _) => record(&mut rejected),
            (_, Status::Moved(_)) => {
                if ours.payload().is_some() {
                    record(&mut rejected);
                }
                state.set_status(id, theirs.clone());
            }
            _ => {
                let decision = resolve(
                    id,
                    base.payload(),
                    &local_head.side(&ours),
                    &remote_head.side(&theirs),
                );
                match decision {
                    Resolution::Accept(payload) => {
                        let checksum = item_checksum(algorithm, &id, &payload.encode()?);
                        state.set_status(id, Status::Live(Entry { payload, checksum }));
                    }
                    Resolution::Delete => state.set_status(id, Status::Absent),
                    Resolution::Reject => record(&mut rejected),
                }
            }
        }
    }

    Ok(MergePlan { state, rejected })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::{ItemChange, Tombstone};
    use crate::types::PartitionId;

    const ALG: DigestAlgorithm = DigestAlgorithm::Sha256;

    fn id(n: u8) -> ElementId {
        ElementId::from_bytes([n; 16])
    }

    fn put(state: &mut State, n: u8, subject: &str) {
        let change = ItemChange::full(ALG, id(n), Payload::new().with("subject", subject)).unwrap();
        state.apply(&change).unwrap();
    }

    fn head(name: &str, millis: i64) -> BranchHead {
        BranchHead {
            head: ALG.digest(name.as_bytes()),
            timestamp: Timestamp::from_millis(millis),
        }
    }

    fn subject(state: &State, n: u8) -> Option<&str> {
        state.payload(&id(n)).and_then(|p| p.text("subject"))
    }

    #[test]
    fn one_sided_changes_are_combined() {
        let mut base = State::new();
        put(&mut base, 1, "one");
        put(&mut base, 2, "two");

        let mut ours = base.clone();
        put(&mut ours, 1, "one-local");
        let mut theirs = base.clone();
        put(&mut theirs, 2, "two-remote");
        put(&mut theirs, 3, "three");

        let plan = plan(ALG, &base, (&ours, head("a", 1)), (&theirs, head("b", 2)), reject_all)
            .unwrap();
        assert!(plan.rejected.is_empty());
        assert_eq!(subject(&plan.state, 1), Some("one-local"));
        assert_eq!(subject(&plan.state, 2), Some("two-remote"));
        assert_eq!(subject(&plan.state, 3), Some("three"));
    }

    #[test]
    fn last_writer_wins_uses_head_timestamps() {
        let mut base = State::new();
        put(&mut base, 1, "x");
        let mut ours = base.clone();
        put(&mut ours, 1, "y");
        let mut theirs = base.clone();
        put(&mut theirs, 1, "z");

        let newer_remote = plan(
            ALG,
            &base,
            (&ours, head("a", 10)),
            (&theirs, head("b", 20)),
            last_writer_wins,
        )
        .unwrap();
        assert_eq!(subject(&newer_remote.state, 1), Some("z"));

        let tie = plan(
            ALG,
            &base,
            (&ours, head("a", 10)),
            (&theirs, head("b", 10)),
            last_writer_wins,
        )
        .unwrap();
        assert_eq!(subject(&tie.state, 1), Some("y"));
    }

    #[test]
    fn rejected_conflicts_keep_local_and_are_recorded() {
        let mut base = State::new();
        put(&mut base, 1, "x");
        let mut ours = base.clone();
        put(&mut ours, 1, "y");
        let mut theirs = base.clone();
        put(&mut theirs, 1, "z");

        let plan = plan(ALG, &base, (&ours, head("a", 1)), (&theirs, head("b", 2)), reject_all)
            .unwrap();
        assert_eq!(subject(&plan.state, 1), Some("y"));
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].remote.as_ref().and_then(|p| p.text("subject")), Some("z"));

        let outcome = MergeOutcome {
            commit_id: ALG.digest(b"m"),
            rejected: plan.rejected,
        };
        assert!(matches!(
            outcome.ensure_clean(),
            Err(CoreError::MergeConflict { rejected }) if rejected.len() == 1
        ));
    }

    #[test]
    fn moves_override_edits() {
        let mut base = State::new();
        put(&mut base, 1, "x");
        let checksum = base.get(&id(1)).unwrap().checksum;
        let mut ours = base.clone();
        put(&mut ours, 1, "edited");
        let mut theirs = base.clone();
        theirs.set_status(
            id(1),
            Status::Moved(Tombstone {
                destination: PartitionId::new("archive").unwrap(),
                checksum,
            }),
        );

        let plan = plan(ALG, &base, (&ours, head("a", 9)), (&theirs, head("b", 1)), prefer_local)
            .unwrap();
        assert!(plan.state.tombstone(&id(1)).is_some());
        assert_eq!(plan.rejected.len(), 1);
    }

    #[test]
    fn union_without_ancestor() {
        let mut ours = State::new();
        put(&mut ours, 1, "a");
        let mut theirs = State::new();
        put(&mut theirs, 2, "b");
        let plan = plan(
            ALG,
            &State::new(),
            (&ours, head("a", 1)),
            (&theirs, head("b", 1)),
            last_writer_wins,
        )
        .unwrap();
        assert_eq!(plan.state.len(), 2);
    }

    #[test]
    fn branch_name_is_stable() {
        let a = ALG.digest(b"a");
        let b = ALG.digest(b"b");
        let name = merge_branch_name(ALG, &a, &b);
        assert!(name.starts_with("merge-"));
        assert_eq!(name.len(), "merge-".len() + 8);
        assert_eq!(name, merge_branch_name(ALG, &a, &b));
        assert_ne!(name, merge_branch_name(ALG, &b, &a));
    }
}
