//! Materialized partition state and change replay.

use super::record::{ChangeKind, Commit, ItemChange};
use crate::checksum::{item_checksum, Digest, DigestAlgorithm, Pyramid};
use crate::error::{CoreError, CoreResult};
use crate::payload::{Payload, PayloadPatch};
use crate::types::{ElementId, PartitionId};
use std::collections::{BTreeMap, BTreeSet};

/// A live element's payload with its item checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Current value.
    pub payload: Payload,
    /// Item checksum of `payload`.
    pub checksum: Digest,
}

/// Marker left behind when an element moves to another partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    /// Where the element went.
    pub destination: PartitionId,
    /// Item checksum of the payload at departure.
    pub checksum: Digest,
}

/// Where an element stands in one state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Status {
    /// Present with a payload.
    Live(Entry),
    /// Moved away.
    Moved(Tombstone),
    /// Never seen, or deleted.
    #[default]
    Absent,
}

impl Status {
    /// Returns the payload if live.
    #[must_use]
    pub fn payload(&self) -> Option<&Payload> {
        match self {
            Self::Live(entry) => Some(&entry.payload),
            _ => None,
        }
    }
}

/// Full state of a partition at one commit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct State {
    live: BTreeMap<ElementId, Entry>,
    moved: BTreeMap<ElementId, Tombstone>,
}

impl State {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live entry of an element.
    #[must_use]
    pub fn get(&self, id: &ElementId) -> Option<&Entry> {
        self.live.get(id)
    }

    /// Returns the payload of a live element.
    #[must_use]
    pub fn payload(&self, id: &ElementId) -> Option<&Payload> {
        self.live.get(id).map(|e| &e.payload)
    }

    /// Returns where a moved element went.
    #[must_use]
    pub fn tombstone(&self, id: &ElementId) -> Option<&Tombstone> {
        self.moved.get(id)
    }

    /// Returns the status of an element.
    #[must_use]
    pub fn status(&self, id: &ElementId) -> Status {
        if let Some(entry) = self.live.get(id) {
            Status::Live(entry.clone())
        } else if let Some(stone) = self.moved.get(id) {
            Status::Moved(stone.clone())
        } else {
            Status::Absent
        }
    }

    /// Returns the number of live elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Returns true if no element is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Iterates over live elements in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&ElementId, &Entry)> {
        self.live.iter()
    }

    /// Iterates over moved-away elements in id order.
    pub fn moved(&self) -> impl Iterator<Item = (&ElementId, &Tombstone)> {
        self.moved.iter()
    }

    /// Copies out the live payloads.
    #[must_use]
    pub fn payloads(&self) -> BTreeMap<ElementId, Payload> {
        self.live
            .iter()
            .map(|(id, entry)| (*id, entry.payload.clone()))
            .collect()
    }

    /// Sets an element's status directly.
    pub fn set_status(&mut self, id: ElementId, status: Status) {
        match status {
            Status::Live(entry) => {
                self.moved.remove(&id);
                self.live.insert(id, entry);
            }
            Status::Moved(stone) => {
                self.live.remove(&id);
                self.moved.insert(id, stone);
            }
            Status::Absent => {
                self.live.remove(&id);
                self.moved.remove(&id);
            }
        }
    }

    /// Computes the status `change` produces, without applying it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for a patch of an element that is not live,
    /// or a non-deletion change without a checksum.
    pub fn resolve(&self, change: &ItemChange) -> CoreResult<Status> {
        let checksum = || {
            change.checksum.ok_or_else(|| {
                CoreError::invalid_format(format!("change for {} lacks a checksum", change.element))
            })
        };
        Ok(match &change.kind {
            ChangeKind::FullState(payload) | ChangeKind::MovedFrom { payload, .. } => {
                Status::Live(Entry {
                    payload: payload.clone(),
                    checksum: checksum()?,
                })
            }
            ChangeKind::Patch(patch) => {
                let base = self.payload(&change.element).ok_or_else(|| {
                    CoreError::invalid_format(format!(
                        "patch for element {} which is not live",
                        change.element
                    ))
                })?;
                Status::Live(Entry {
                    payload: patch.apply(base),
                    checksum: checksum()?,
                })
            }
            ChangeKind::Deletion => Status::Absent,
            ChangeKind::MovedTo(destination) => Status::Moved(Tombstone {
                destination: destination.clone(),
                checksum: checksum()?,
            }),
        })
    }

    /// Like [`State::resolve`], and also recomputes the item checksum of
    /// the resulting payload (for a departure, of the departing payload)
    /// and compares it with the stored one.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` on a checksum mismatch, or any error of
    /// [`State::resolve`].
    pub fn resolve_verified(&self, algorithm: DigestAlgorithm, change: &ItemChange) -> CoreResult<Status> {
        let status = self.resolve(change)?;
        let checked = match &status {
            Status::Live(entry) => Some((&entry.payload, entry.checksum)),
            Status::Moved(stone) => self.get(&change.element).map(|d| (&d.payload, stone.checksum)),
            Status::Absent => None,
        };
        if let Some((payload, stored)) = checked {
            if item_checksum(algorithm, &change.element, &payload.encode()?) != stored {
                return Err(CoreError::invalid_format(format!(
                    "item checksum of element {} does not match its payload",
                    change.element
                )));
            }
        }
        Ok(status)
    }

    /// Applies every change of a stored commit, verifying item checksums.
    ///
    /// # Errors
    ///
    /// Returns `CorruptCommit` naming the commit if a change does not apply
    /// or its checksum does not match.
    pub fn apply_commit(&mut self, algorithm: DigestAlgorithm, commit: &Commit) -> CoreResult<()> {
        for change in &commit.changes {
            let status = self
                .resolve_verified(algorithm, change)
                .map_err(|e| CoreError::corrupt_commit(commit.id, e.to_string()))?;
            self.set_status(change.element, status);
        }
        Ok(())
    }

    /// Applies one item change.
    ///
    /// # Errors
    ///
    /// See [`State::resolve`].
    pub fn apply(&mut self, change: &ItemChange) -> CoreResult<()> {
        let status = self.resolve(change)?;
        self.set_status(change.element, status);
        Ok(())
    }

    /// Applies every change of a commit, in order.
    ///
    /// # Errors
    ///
    /// See [`State::resolve`].
    pub fn apply_all(&mut self, changes: &[ItemChange]) -> CoreResult<()> {
        changes.iter().try_for_each(|c| self.apply(c))
    }

    /// Computes the state checksum.
    #[must_use]
    pub fn checksum(&self, algorithm: DigestAlgorithm, group_size: usize) -> Digest {
        let leaves = self.live.values().map(|e| e.checksum).collect();
        Pyramid::build(algorithm, group_size, leaves).root()
    }

    /// Computes the item changes that turn `self` into `target`, in element
    /// id order, skipping elements whose status is unchanged.
    ///
    /// # Errors
    ///
    /// Returns an encoding error if a payload cannot be serialized.
    pub fn changes_to(&self, target: &State, patch_ratio: f64) -> CoreResult<Vec<ItemChange>> {
        let ids: BTreeSet<ElementId> = self
            .live
            .keys()
            .chain(self.moved.keys())
            .chain(target.live.keys())
            .chain(target.moved.keys())
            .copied()
            .collect();

        let mut changes = Vec::new();
        for id in ids {
            let before = self.status(&id);
            let after = target.status(&id);
            if before == after {
                continue;
            }
            let change = match after {
                Status::Live(entry) => {
                    encode_update(id, before.payload(), entry, patch_ratio)?
                }
                Status::Moved(stone) => ItemChange::moved_to(id, stone.destination, stone.checksum),
                Status::Absent => ItemChange::deletion(id),
            };
            changes.push(change);
        }
        Ok(changes)
    }

    pub(crate) fn from_parts(
        live: BTreeMap<ElementId, Entry>,
        moved: BTreeMap<ElementId, Tombstone>,
    ) -> Self {
        Self { live, moved }
    }
}

/// Builds the change storing `entry` over `previous`: a patch when the
/// patch encoding is smaller than `patch_ratio` times the full encoding,
/// otherwise the full payload.
///
/// # Errors
///
/// Returns an encoding error if a payload cannot be serialized.
pub fn encode_update(
    id: ElementId,
    previous: Option<&Payload>,
    entry: Entry,
    patch_ratio: f64,
) -> CoreResult<ItemChange> {
    if let Some(previous) = previous {
        let patch = PayloadPatch::diff(previous, &entry.payload);
        let patch_len = patch.encode()?.len() as f64;
        let full_len = entry.payload.encode()?.len() as f64;
        if patch_len < patch_ratio * full_len {
            return Ok(ItemChange::patch(id, patch, entry.checksum));
        }
    }
    Ok(ItemChange {
        element: id,
        kind: ChangeKind::FullState(entry.payload),
        checksum: Some(entry.checksum),
    })
}

/// A state with its checksum pyramid kept up to date on every change.
#[derive(Debug, Clone)]
pub struct TrackedState {
    state: State,
    keys: Vec<ElementId>,
    pyramid: Pyramid,
}

impl TrackedState {
    /// Wraps a state, building its pyramid once.
    #[must_use]
    pub fn new(state: State, algorithm: DigestAlgorithm, group_size: usize) -> Self {
        let keys: Vec<ElementId> = state.live.keys().copied().collect();
        let leaves = state.live.values().map(|e| e.checksum).collect();
        Self {
            pyramid: Pyramid::build(algorithm, group_size, leaves),
            keys,
            state,
        }
    }

    /// Returns the state.
    #[must_use]
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Returns the state checksum.
    #[must_use]
    pub fn checksum(&self) -> Digest {
        self.pyramid.root()
    }

    /// Sets an element's status, re-hashing only the affected branch.
    pub fn set_status(&mut self, id: ElementId, status: Status) {
        let position = self.keys.binary_search(&id);
        match (&status, position) {
            (Status::Live(entry), Ok(index)) => self.pyramid.update(index, entry.checksum),
            (Status::Live(entry), Err(index)) => {
                self.keys.insert(index, id);
                self.pyramid.insert(index, entry.checksum);
            }
            (_, Ok(index)) => {
                self.keys.remove(index);
                self.pyramid.remove(index);
            }
            (_, Err(_)) => {}
        }
        self.state.set_status(id, status);
    }

    /// Applies one item change.
    ///
    /// # Errors
    ///
    /// See [`State::resolve`].
    pub fn apply(&mut self, change: &ItemChange) -> CoreResult<()> {
        let status = self.state.resolve(change)?;
        self.set_status(change.element, status);
        Ok(())
    }

    /// Applies every change of a stored commit, verifying item checksums.
    ///
    /// # Errors
    ///
    /// See [`State::apply_commit`].
    pub fn apply_commit(&mut self, commit: &Commit) -> CoreResult<()> {
        let algorithm = self.pyramid.algorithm();
        for change in &commit.changes {
            let status = self
                .state
                .resolve_verified(algorithm, change)
                .map_err(|e| CoreError::corrupt_commit(commit.id, e.to_string()))?;
            self.set_status(change.element, status);
        }
        Ok(())
    }

    /// Unwraps the state.
    #[must_use]
    pub fn into_state(self) -> State {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitDraft;

    const ALG: DigestAlgorithm = DigestAlgorithm::Sha256;

    fn id(n: u8) -> ElementId {
        ElementId::from_bytes([n; 16])
    }

    fn put(n: u8, subject: &str) -> ItemChange {
        ItemChange::full(ALG, id(n), Payload::new().with("subject", subject)).unwrap()
    }

    #[test]
    fn replay_applies_each_kind() {
        let mut state = State::new();
        state.apply(&put(1, "a")).unwrap();
        state.apply(&put(2, "b")).unwrap();

        let new = Payload::new().with("subject", "a2");
        let sum = item_checksum(ALG, &id(1), &new.encode().unwrap());
        let patch = PayloadPatch::diff(state.payload(&id(1)).unwrap(), &new);
        state.apply(&ItemChange::patch(id(1), patch, sum)).unwrap();
        assert_eq!(state.payload(&id(1)), Some(&new));

        state.apply(&ItemChange::deletion(id(2))).unwrap();
        assert!(state.payload(&id(2)).is_none());

        let dest = PartitionId::new("archive").unwrap();
        state.apply(&ItemChange::moved_to(id(1), dest.clone(), sum)).unwrap();
        assert!(state.is_empty());
        assert_eq!(state.tombstone(&id(1)).unwrap().destination, dest);

        let back = ItemChange::moved_from(ALG, id(1), dest, new.clone()).unwrap();
        state.apply(&back).unwrap();
        assert_eq!(state.payload(&id(1)), Some(&new));
        assert!(state.tombstone(&id(1)).is_none());
    }

    #[test]
    fn patch_of_absent_element_fails() {
        let mut state = State::new();
        let change = ItemChange::patch(id(1), PayloadPatch::default(), Digest::ZERO);
        assert!(matches!(
            state.apply(&change),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn changes_to_reaches_target() {
        let mut a = State::new();
        a.apply_all(&[put(1, "one"), put(2, "two"), put(3, "three")]).unwrap();
        let mut b = a.clone();
        b.apply_all(&[put(1, "uno"), ItemChange::deletion(id(2)), put(4, "four")])
            .unwrap();

        let changes = a.changes_to(&b, 0.5).unwrap();
        let ids: Vec<ElementId> = changes.iter().map(|c| c.element).collect();
        assert_eq!(ids, vec![id(1), id(2), id(4)]);

        let mut replayed = a.clone();
        replayed.apply_all(&changes).unwrap();
        assert_eq!(replayed, b);
        assert!(b.changes_to(&b, 0.5).unwrap().is_empty());
    }

    #[test]
    fn large_payload_small_edit_uses_patch() {
        let big = Payload::new()
            .with("body", "x".repeat(500))
            .with("subject", "s");
        let edited = big.clone().with("subject", "t");
        let sum = item_checksum(ALG, &id(1), &edited.encode().unwrap());
        let entry = Entry {
            payload: edited,
            checksum: sum,
        };
        let change = encode_update(id(1), Some(&big), entry.clone(), 0.5).unwrap();
        assert!(matches!(change.kind, ChangeKind::Patch(_)));

        let change = encode_update(id(1), None, entry, 0.5).unwrap();
        assert!(matches!(change.kind, ChangeKind::FullState(_)));
    }

    #[test]
    fn tracked_checksum_matches_full_computation() {
        let mut tracked = TrackedState::new(State::new(), ALG, 2);
        for n in 0..20u8 {
            tracked.apply(&put(n, "v")).unwrap();
            assert_eq!(tracked.checksum(), tracked.state().checksum(ALG, 2));
        }
        for n in (0..20u8).step_by(3) {
            tracked.apply(&ItemChange::deletion(id(n))).unwrap();
            assert_eq!(tracked.checksum(), tracked.state().checksum(ALG, 2));
        }
        tracked.apply(&put(5, "changed")).unwrap();
        assert_eq!(tracked.checksum(), tracked.state().checksum(ALG, 2));
    }

    #[test]
    fn verified_replay_rejects_forged_checksums() {
        let mut state = State::new();
        state.apply(&put(1, "a")).unwrap();

        let forged = ItemChange {
            element: id(2),
            kind: ChangeKind::FullState(Payload::new().with("subject", "b")),
            checksum: Some(ALG.digest(b"something else")),
        };
        assert!(state.apply(&forged).is_ok());
        assert!(matches!(
            State::new().resolve_verified(ALG, &forged),
            Err(CoreError::InvalidFormat { .. })
        ));

        let new = Payload::new().with("subject", "a2");
        let patch = PayloadPatch::diff(state.payload(&id(1)).unwrap(), &new);
        let wrong = ItemChange::patch(id(1), patch, ALG.digest(b"stale"));
        assert!(state.resolve_verified(ALG, &wrong).is_err());

        let dest = PartitionId::new("archive").unwrap();
        let departure = ItemChange::moved_to(id(1), dest.clone(), ALG.digest(b"stale"));
        assert!(state.resolve_verified(ALG, &departure).is_err());
        let sum = state.get(&id(1)).unwrap().checksum;
        assert!(state.resolve_verified(ALG, &ItemChange::moved_to(id(1), dest, sum)).is_ok());
    }

    #[test]
    fn apply_commit_names_the_commit() {
        let bad = ItemChange {
            element: id(3),
            kind: ChangeKind::FullState(Payload::new().with("n", 3_i64)),
            checksum: Some(Digest::ZERO),
        };
        let (commit, _) = CommitDraft {
            changes: vec![put(1, "a"), bad],
            ..Default::default()
        }
        .seal(ALG)
        .unwrap();

        let mut tracked = TrackedState::new(State::new(), ALG, 4);
        match tracked.apply_commit(&commit) {
            Err(CoreError::CorruptCommit { commit_id, .. }) => assert_eq!(commit_id, commit.id),
            other => panic!("expected CorruptCommit, got {other:?}"),
        }
        let mut plain = State::new();
        assert!(plain.apply_commit(ALG, &commit).is_err());
    }
}
