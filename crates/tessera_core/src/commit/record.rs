//! Commit records and their binary encoding.
//!
//! ```text
//! magic "TCMT" | version u16 | record_len u32 | timestamp i64 |
//! parent_count u8 | parents (32 each) | branch_len u16 | branch |
//! state_checksum 32 | item_count u32 | item changes |
//! rejected_count u32 | rejected entries | commit_id 32
//! ```
//!
//! The commit id is the digest of every byte before it, so it covers all
//! other fields. `record_len` counts the whole record including the id.

use crate::checksum::{item_checksum, Digest, DigestAlgorithm};
use crate::codec::{put_blob, put_i64, put_short_str, put_u16, put_u32, ByteReader};
use crate::error::{CoreError, CoreResult};
use crate::payload::{Payload, PayloadPatch};
use crate::types::{ElementId, PartitionId, Timestamp};

/// Identifier of a commit: the digest of its serialized record.
pub type CommitId = Digest;

/// Magic bytes identifying a commit record.
pub const COMMIT_MAGIC: [u8; 4] = *b"TCMT";

/// Current commit format version.
pub const COMMIT_VERSION: u16 = 1;

/// Maximum number of parents a commit may name.
pub const MAX_PARENTS: usize = u8::MAX as usize;

const PREFIX_LEN: usize = 10; // magic + version + record_len

/// Kind tag of an item change on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChangeTag {
    /// Full payload.
    FullState = 1,
    /// Patch over the previous payload.
    Patch = 2,
    /// Element removed.
    Deletion = 3,
    /// Element left for another partition.
    MovedTo = 4,
    /// Element arrived from another partition.
    MovedFrom = 5,
}

impl ChangeTag {
    /// Converts a byte to a tag.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::FullState),
            2 => Some(Self::Patch),
            3 => Some(Self::Deletion),
            4 => Some(Self::MovedTo),
            5 => Some(Self::MovedFrom),
            _ => None,
        }
    }
}

/// What happened to an element in one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// The element now holds this payload.
    FullState(Payload),
    /// The element's previous payload was patched.
    Patch(PayloadPatch),
    /// The element was removed.
    Deletion,
    /// The element moved to another partition.
    MovedTo(PartitionId),
    /// The element arrived from another partition with this payload.
    MovedFrom {
        /// Partition the element came from.
        source: PartitionId,
        /// Its full payload.
        payload: Payload,
    },
}

impl ChangeKind {
    /// Returns the on-disk tag.
    #[must_use]
    pub fn tag(&self) -> ChangeTag {
        match self {
            Self::FullState(_) => ChangeTag::FullState,
            Self::Patch(_) => ChangeTag::Patch,
            Self::Deletion => ChangeTag::Deletion,
            Self::MovedTo(_) => ChangeTag::MovedTo,
            Self::MovedFrom { .. } => ChangeTag::MovedFrom,
        }
    }
}

/// One element's change within a commit.
///
/// Every kind except [`ChangeKind::Deletion`] carries the item checksum of
/// the element's resulting payload (for `MovedTo`, the departing payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemChange {
    /// The element changed.
    pub element: ElementId,
    /// The change.
    pub kind: ChangeKind,
    /// Item checksum, absent only for deletions.
    pub checksum: Option<Digest>,
}

impl ItemChange {
    /// A full-state change.
    ///
    /// # Errors
    ///
    /// Returns an encoding error if the payload cannot be serialized.
    pub fn full(algorithm: DigestAlgorithm, element: ElementId, payload: Payload) -> CoreResult<Self> {
        let checksum = item_checksum(algorithm, &element, &payload.encode()?);
        Ok(Self {
            element,
            kind: ChangeKind::FullState(payload),
            checksum: Some(checksum),
        })
    }

    /// A patch change; `checksum` is the item checksum of the patched payload.
    #[must_use]
    pub fn patch(element: ElementId, patch: PayloadPatch, checksum: Digest) -> Self {
        Self {
            element,
            kind: ChangeKind::Patch(patch),
            checksum: Some(checksum),
        }
    }

    /// A deletion.
    #[must_use]
    pub fn deletion(element: ElementId) -> Self {
        Self {
            element,
            kind: ChangeKind::Deletion,
            checksum: None,
        }
    }

    /// A departure; `checksum` is the item checksum of the departing payload.
    #[must_use]
    pub fn moved_to(element: ElementId, destination: PartitionId, checksum: Digest) -> Self {
        Self {
            element,
            kind: ChangeKind::MovedTo(destination),
            checksum: Some(checksum),
        }
    }

    /// An arrival.
    ///
    /// # Errors
    ///
    /// Returns an encoding error if the payload cannot be serialized.
    pub fn moved_from(
        algorithm: DigestAlgorithm,
        element: ElementId,
        source: PartitionId,
        payload: Payload,
    ) -> CoreResult<Self> {
        let checksum = item_checksum(algorithm, &element, &payload.encode()?);
        Ok(Self {
            element,
            kind: ChangeKind::MovedFrom { source, payload },
            checksum: Some(checksum),
        })
    }

    fn encode(&self, buf: &mut Vec<u8>) -> CoreResult<()> {
        buf.extend_from_slice(self.element.as_bytes());
        buf.push(self.kind.tag() as u8);
        match &self.kind {
            ChangeKind::FullState(payload) => put_blob(buf, &payload.encode()?)?,
            ChangeKind::Patch(patch) => put_blob(buf, &patch.encode()?)?,
            ChangeKind::Deletion => return Ok(()),
            ChangeKind::MovedTo(dest) => put_short_str(buf, dest.as_str())?,
            ChangeKind::MovedFrom { source, payload } => {
                put_short_str(buf, source.as_str())?;
                put_blob(buf, &payload.encode()?)?;
            }
        }
        let checksum = self.checksum.ok_or_else(|| {
            CoreError::encoding(format!("item change for {} lacks a checksum", self.element))
        })?;
        buf.extend_from_slice(checksum.as_bytes());
        Ok(())
    }

    fn decode(r: &mut ByteReader<'_>) -> CoreResult<Self> {
        let element = r.element_id("change element id")?;
        let tag_byte = r.u8("change kind")?;
        let tag = ChangeTag::from_byte(tag_byte)
            .ok_or_else(|| CoreError::invalid_format(format!("unknown change kind {tag_byte}")))?;
        let kind = match tag {
            ChangeTag::FullState => ChangeKind::FullState(Payload::decode(r.blob("payload")?)?),
            ChangeTag::Patch => ChangeKind::Patch(PayloadPatch::decode(r.blob("patch")?)?),
            ChangeTag::Deletion => {
                return Ok(Self::deletion(element));
            }
            ChangeTag::MovedTo => ChangeKind::MovedTo(r.partition_id("move destination")?),
            ChangeTag::MovedFrom => {
                let source = r.partition_id("move source")?;
                let payload = Payload::decode(r.blob("payload")?)?;
                ChangeKind::MovedFrom { source, payload }
            }
        };
        let checksum = r.digest("item checksum")?;
        Ok(Self {
            element,
            kind,
            checksum: Some(checksum),
        })
    }
}

/// A merge candidate that the resolver rejected, kept for audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedChange {
    /// The element in conflict.
    pub element: ElementId,
    /// Value on the local (first parent) side; `None` if absent there.
    pub local: Option<Payload>,
    /// Value on the merged-in side; `None` if absent there.
    pub remote: Option<Payload>,
}

fn put_opt_payload(buf: &mut Vec<u8>, payload: Option<&Payload>) -> CoreResult<()> {
    match payload {
        Some(p) => {
            buf.push(1);
            put_blob(buf, &p.encode()?)
        }
        None => {
            buf.push(0);
            Ok(())
        }
    }
}

fn read_opt_payload(r: &mut ByteReader<'_>) -> CoreResult<Option<Payload>> {
    match r.u8("rejected value flag")? {
        0 => Ok(None),
        1 => Ok(Some(Payload::decode(r.blob("rejected value")?)?)),
        other => Err(CoreError::invalid_format(format!(
            "bad rejected value flag {other}"
        ))),
    }
}

/// An immutable commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Digest of the serialized record.
    pub id: CommitId,
    /// Parents: none for a root, one normally, several for a merge.
    pub parents: Vec<CommitId>,
    /// Creation time, never earlier than the first parent's.
    pub timestamp: Timestamp,
    /// Branch tag, set on merge commits and commits from a named clone.
    pub branch: Option<String>,
    /// Checksum of the full state this commit produces.
    pub state_checksum: Digest,
    /// Item changes, in the order they are applied.
    pub changes: Vec<ItemChange>,
    /// Merge candidates that were rejected.
    pub rejected: Vec<RejectedChange>,
}

/// Fields of a commit before its id is known.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitDraft {
    /// Parents.
    pub parents: Vec<CommitId>,
    /// Timestamp.
    pub timestamp: Timestamp,
    /// Branch tag.
    pub branch: Option<String>,
    /// Resulting state checksum.
    pub state_checksum: Digest,
    /// Item changes.
    pub changes: Vec<ItemChange>,
    /// Rejected merge candidates.
    pub rejected: Vec<RejectedChange>,
}

impl CommitDraft {
    /// Serializes the draft and computes its id.
    ///
    /// Returns the finished commit and its record bytes.
    ///
    /// # Errors
    ///
    /// Returns an encoding error if a field does not fit its length prefix.
    pub fn seal(self, algorithm: DigestAlgorithm) -> CoreResult<(Commit, Vec<u8>)> {
        let mut commit = Commit {
            id: Digest::ZERO,
            parents: self.parents,
            timestamp: self.timestamp,
            branch: self.branch,
            state_checksum: self.state_checksum,
            changes: self.changes,
            rejected: self.rejected,
        };
        let mut bytes = commit.encode_body()?;
        commit.id = algorithm.digest(&bytes);
        bytes.extend_from_slice(commit.id.as_bytes());
        Ok((commit, bytes))
    }
}

/// Result of parsing a commit record whose framing is intact.
#[derive(Debug, Clone)]
pub struct ParsedCommit {
    /// The decoded commit, carrying the id stored in the record.
    pub commit: Commit,
    /// Digest recomputed over the record body.
    pub computed_id: CommitId,
}

impl ParsedCommit {
    /// Returns true if the stored id matches the content.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.commit.id == self.computed_id
    }

    /// Returns the commit if intact, or `CorruptCommit`.
    ///
    /// # Errors
    ///
    /// Returns `CorruptCommit` naming the stored id on mismatch.
    pub fn verified(self) -> CoreResult<Commit> {
        if self.is_intact() {
            Ok(self.commit)
        } else {
            Err(CoreError::corrupt_commit(
                self.commit.id,
                format!("content hashes to {}", self.computed_id.short()),
            ))
        }
    }
}

impl Commit {
    /// Returns the first parent, if any.
    #[must_use]
    pub fn first_parent(&self) -> Option<CommitId> {
        self.parents.first().copied()
    }

    /// Returns true for commits with two or more parents.
    #[must_use]
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// Serializes the record, including the stored id.
    ///
    /// # Errors
    ///
    /// Returns an encoding error if a field does not fit its length prefix.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut bytes = self.encode_body()?;
        bytes.extend_from_slice(self.id.as_bytes());
        Ok(bytes)
    }

    fn encode_body(&self) -> CoreResult<Vec<u8>> {
        if self.parents.len() > MAX_PARENTS {
            return Err(CoreError::encoding(format!(
                "{} parents exceed the maximum of {MAX_PARENTS}",
                self.parents.len()
            )));
        }
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&COMMIT_MAGIC);
        put_u16(&mut buf, COMMIT_VERSION);
        put_u32(&mut buf, 0); // record_len, patched below
        put_i64(&mut buf, self.timestamp.as_millis());
        buf.push(self.parents.len() as u8);
        for parent in &self.parents {
            buf.extend_from_slice(parent.as_bytes());
        }
        put_short_str(&mut buf, self.branch.as_deref().unwrap_or(""))?;
        buf.extend_from_slice(self.state_checksum.as_bytes());

        let count = u32::try_from(self.changes.len())
            .map_err(|_| CoreError::encoding("too many item changes"))?;
        put_u32(&mut buf, count);
        for change in &self.changes {
            change.encode(&mut buf)?;
        }

        let rejected = u32::try_from(self.rejected.len())
            .map_err(|_| CoreError::encoding("too many rejected changes"))?;
        put_u32(&mut buf, rejected);
        for entry in &self.rejected {
            buf.extend_from_slice(entry.element.as_bytes());
            put_opt_payload(&mut buf, entry.local.as_ref())?;
            put_opt_payload(&mut buf, entry.remote.as_ref())?;
        }

        let total = u32::try_from(buf.len() + Digest::LEN)
            .map_err(|_| CoreError::encoding("commit record too large"))?;
        buf[6..10].copy_from_slice(&total.to_le_bytes());
        Ok(buf)
    }

    /// Parses a record, reporting (rather than failing on) an id mismatch.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the framing is broken.
    pub fn parse(bytes: &[u8], algorithm: DigestAlgorithm) -> CoreResult<ParsedCommit> {
        let mut r = ByteReader::new(bytes);
        if r.bytes(4, "commit magic")? != COMMIT_MAGIC {
            return Err(CoreError::invalid_format("bad commit magic"));
        }
        let version = r.u16("commit version")?;
        if version != COMMIT_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported commit version {version}"
            )));
        }
        let record_len = r.u32("record length")? as usize;
        if record_len != bytes.len() || record_len < PREFIX_LEN + Digest::LEN {
            return Err(CoreError::invalid_format(format!(
                "commit record length {record_len} does not match {} available bytes",
                bytes.len()
            )));
        }

        let timestamp = Timestamp::from_millis(r.i64("timestamp")?);
        let parent_count = usize::from(r.u8("parent count")?);
        let mut parents = Vec::with_capacity(parent_count);
        for _ in 0..parent_count {
            parents.push(r.digest("parent id")?);
        }
        let branch = r.short_str("branch")?;
        let branch = (!branch.is_empty()).then_some(branch);
        let state_checksum = r.digest("state checksum")?;

        let count = r.u32("item count")? as usize;
        let mut changes = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            changes.push(ItemChange::decode(&mut r)?);
        }

        let rejected_count = r.u32("rejected count")? as usize;
        let mut rejected = Vec::with_capacity(rejected_count.min(r.remaining()));
        for _ in 0..rejected_count {
            let element = r.element_id("rejected element")?;
            let local = read_opt_payload(&mut r)?;
            let remote = read_opt_payload(&mut r)?;
            rejected.push(RejectedChange {
                element,
                local,
                remote,
            });
        }

        let body_len = r.position();
        let id = r.digest("commit id")?;
        r.finish("commit record")?;

        Ok(ParsedCommit {
            commit: Commit {
                id,
                parents,
                timestamp,
                branch,
                state_checksum,
                changes,
                rejected,
            },
            computed_id: algorithm.digest(&bytes[..body_len]),
        })
    }

    /// Parses a record and checks its id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` for broken framing, `AlgorithmMismatch` if
    /// the stored id was computed with another algorithm, and
    /// `CorruptCommit` if it matches no algorithm.
    pub fn decode(bytes: &[u8], algorithm: DigestAlgorithm) -> CoreResult<Self> {
        let parsed = Self::parse(bytes, algorithm)?;
        if !parsed.is_intact() {
            let body = &bytes[..bytes.len() - Digest::LEN];
            let found = DigestAlgorithm::ALL
                .into_iter()
                .find(|other| *other != algorithm && other.digest(body) == parsed.commit.id);
            if let Some(found) = found {
                return Err(CoreError::AlgorithmMismatch {
                    expected: algorithm,
                    found,
                });
            }
        }
        parsed.verified()
    }

    /// Recomputes the item checksums of full payloads (full states and
    /// arrivals) and compares them with the stored ones.
    ///
    /// Patches and departures are checked when they are applied, since
    /// their checksums cover a payload this record does not carry.
    ///
    /// # Errors
    ///
    /// Returns `CorruptCommit` naming the first element whose checksum
    /// does not match.
    pub fn check_items(&self, algorithm: DigestAlgorithm) -> CoreResult<()> {
        for change in &self.changes {
            let (ChangeKind::FullState(payload) | ChangeKind::MovedFrom { payload, .. }) =
                &change.kind
            else {
                continue;
            };
            let actual = item_checksum(algorithm, &change.element, &payload.encode()?);
            if change.checksum != Some(actual) {
                return Err(CoreError::corrupt_commit(
                    self.id,
                    format!(
                        "item checksum of element {} does not match its payload",
                        change.element
                    ),
                ));
            }
        }
        Ok(())
    }
}
