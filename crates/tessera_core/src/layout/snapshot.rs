//! Snapshot files.
//!
//! ```text
//! magic "TSNP" | version u16 | algorithm u8 | reserved u8 |
//! base_timestamp i64 | base_commit_id 32 | state_checksum 32 |
//! live_count u32 | (element_id 16 | len u32 | payload | item_checksum 32)* |
//! moved_count u32 | (element_id 16 | dest_len u16 | dest | item_checksum 32)* |
//! digest 32
//! ```
//!
//! The trailing digest covers every preceding byte. A zero base commit id
//! marks the empty state a partition starts from.

use crate::checksum::{item_checksum, Digest, DigestAlgorithm};
use crate::codec::{put_blob, put_i64, put_short_str, put_u16, put_u32, ByteReader};
use crate::commit::{CommitId, Entry, State, Tombstone};
use crate::error::{CoreError, CoreResult};
use crate::payload::Payload;
use crate::types::Timestamp;
use std::collections::BTreeMap;

/// Magic bytes identifying a snapshot.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"TSNP";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u16 = 1;

/// A full materialized state tagged with the commit it was taken at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Digest algorithm of the partition.
    pub algorithm: DigestAlgorithm,
    /// Commit the state corresponds to; `None` for the empty root state.
    pub base: Option<CommitId>,
    /// Timestamp of the base commit.
    pub base_timestamp: Timestamp,
    /// Checksum of `state`.
    pub state_checksum: Digest,
    /// The state.
    pub state: State,
}

impl Snapshot {
    /// The empty state a new partition starts from.
    #[must_use]
    pub fn empty(algorithm: DigestAlgorithm, group_size: usize) -> Self {
        Self::new(algorithm, group_size, None, Timestamp::default(), State::new())
    }

    /// A snapshot of `state` at `base`.
    #[must_use]
    pub fn new(
        algorithm: DigestAlgorithm,
        group_size: usize,
        base: Option<CommitId>,
        base_timestamp: Timestamp,
        state: State,
    ) -> Self {
        Self {
            algorithm,
            base,
            base_timestamp,
            state_checksum: state.checksum(algorithm, group_size),
            state,
        }
    }

    /// Serializes the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an encoding error if a payload cannot be serialized.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&SNAPSHOT_MAGIC);
        put_u16(&mut buf, SNAPSHOT_VERSION);
        buf.push(self.algorithm.as_byte());
        buf.push(0);
        put_i64(&mut buf, self.base_timestamp.as_millis());
        buf.extend_from_slice(self.base.unwrap_or(Digest::ZERO).as_bytes());
        buf.extend_from_slice(self.state_checksum.as_bytes());

        let live = u32::try_from(self.state.len())
            .map_err(|_| CoreError::encoding("too many live elements"))?;
        put_u32(&mut buf, live);
        for (id, entry) in self.state.iter() {
            buf.extend_from_slice(id.as_bytes());
            put_blob(&mut buf, &entry.payload.encode()?)?;
            buf.extend_from_slice(entry.checksum.as_bytes());
        }

        let moved: Vec<_> = self.state.moved().collect();
        let count = u32::try_from(moved.len())
            .map_err(|_| CoreError::encoding("too many moved elements"))?;
        put_u32(&mut buf, count);
        for (id, stone) in moved {
            buf.extend_from_slice(id.as_bytes());
            put_short_str(&mut buf, stone.destination.as_str())?;
            buf.extend_from_slice(stone.checksum.as_bytes());
        }

        let digest = self.algorithm.digest(&buf);
        buf.extend_from_slice(digest.as_bytes());
        Ok(buf)
    }

    /// Decodes and fully verifies a snapshot of `generation`.
    ///
    /// # Errors
    ///
    /// Returns `AlgorithmMismatch` if the snapshot uses another algorithm
    /// than `expected`, and `CorruptSnapshot` for any damage: bad framing,
    /// digest mismatch, item checksum mismatch or state checksum mismatch.
    pub fn decode(
        bytes: &[u8],
        generation: u64,
        expected: Option<DigestAlgorithm>,
        group_size: usize,
    ) -> CoreResult<Self> {
        let corrupt = |e: CoreError| match e {
            CoreError::AlgorithmMismatch { .. } | CoreError::CorruptSnapshot { .. } => e,
            other => CoreError::corrupt_snapshot(generation, other.to_string()),
        };
        Self::decode_inner(bytes, generation, expected, group_size).map_err(corrupt)
    }

    fn decode_inner(
        bytes: &[u8],
        generation: u64,
        expected: Option<DigestAlgorithm>,
        group_size: usize,
    ) -> CoreResult<Self> {
        if bytes.len() < Digest::LEN {
            return Err(CoreError::invalid_format("snapshot too short"));
        }
        let mut r = ByteReader::new(bytes);
        if r.bytes(4, "snapshot magic")? != SNAPSHOT_MAGIC {
            return Err(CoreError::invalid_format("bad snapshot magic"));
        }
        let version = r.u16("snapshot version")?;
        if version != SNAPSHOT_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported snapshot version {version}"
            )));
        }
        let alg = r.u8("algorithm")?;
        let algorithm = DigestAlgorithm::from_byte(alg)
            .ok_or_else(|| CoreError::invalid_format(format!("unknown digest algorithm {alg}")))?;
        if let Some(expected) = expected {
            if expected != algorithm {
                return Err(CoreError::AlgorithmMismatch {
                    expected,
                    found: algorithm,
                });
            }
        }

        let body_len = bytes.len() - Digest::LEN;
        let stored = Digest::from_bytes(
            bytes[body_len..]
                .try_into()
                .map_err(|_| CoreError::invalid_format("snapshot digest"))?,
        );
        if algorithm.digest(&bytes[..body_len]) != stored {
            return Err(CoreError::corrupt_snapshot(generation, "digest mismatch"));
        }

        r.u8("reserved")?;
        let base_timestamp = Timestamp::from_millis(r.i64("base timestamp")?);
        let base = r.digest("base commit")?;
        let state_checksum = r.digest("state checksum")?;

        let live_count = r.u32("live count")? as usize;
        let mut live = BTreeMap::new();
        for _ in 0..live_count {
            let id = r.element_id("element id")?;
            let raw = r.blob("payload")?;
            let checksum = r.digest("item checksum")?;
            if item_checksum(algorithm, &id, raw) != checksum {
                return Err(CoreError::corrupt_snapshot(
                    generation,
                    format!("item checksum mismatch for {id}"),
                ));
            }
            let payload = Payload::decode(raw)?;
            live.insert(id, Entry { payload, checksum });
        }

        let moved_count = r.u32("moved count")? as usize;
        let mut moved = BTreeMap::new();
        for _ in 0..moved_count {
            let id = r.element_id("moved element id")?;
            let destination = r.partition_id("move destination")?;
            let checksum = r.digest("departure checksum")?;
            moved.insert(id, Tombstone { destination, checksum });
        }

        if r.position() != body_len {
            return Err(CoreError::invalid_format("trailing bytes in snapshot"));
        }

        let state = State::from_parts(live, moved);
        if state.checksum(algorithm, group_size) != state_checksum {
            return Err(CoreError::corrupt_snapshot(generation, "state checksum mismatch"));
        }

        Ok(Self {
            algorithm,
            base: (!base.is_zero()).then_some(base),
            base_timestamp,
            state_checksum,
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::ItemChange;
    use crate::types::{ElementId, PartitionId};

    const ALG: DigestAlgorithm = DigestAlgorithm::Sha256;

    fn sample() -> Snapshot {
        let mut state = State::new();
        for n in 1..=3u8 {
            let payload = Payload::new().with("n", i64::from(n));
            state
                .apply(&ItemChange::full(ALG, ElementId::from_bytes([n; 16]), payload).unwrap())
                .unwrap();
        }
        let gone = ItemChange::moved_to(
            ElementId::from_bytes([2; 16]),
            PartitionId::new("archive").unwrap(),
            state.get(&ElementId::from_bytes([2; 16])).unwrap().checksum,
        );
        state.apply(&gone).unwrap();
        Snapshot::new(ALG, 64, Some(ALG.digest(b"c7")), Timestamp::from_millis(99), state)
    }

    #[test]
    fn decode_matches_encode() {
        let snap = sample();
        let bytes = snap.encode().unwrap();
        assert_eq!(Snapshot::decode(&bytes, 1, Some(ALG), 64).unwrap(), snap);

        let empty = Snapshot::empty(ALG, 64);
        let decoded = Snapshot::decode(&empty.encode().unwrap(), 0, None, 64).unwrap();
        assert_eq!(decoded.base, None);
        assert!(decoded.state.is_empty());
    }

    #[test]
    fn any_flipped_byte_is_corrupt() {
        let bytes = sample().encode().unwrap();
        for position in [0, 9, 20, bytes.len() / 2, bytes.len() - 1] {
            let mut damaged = bytes.clone();
            damaged[position] ^= 0x20;
            let result = Snapshot::decode(&damaged, 4, Some(ALG), 64);
            assert!(
                matches!(result, Err(CoreError::CorruptSnapshot { generation: 4, .. })),
                "byte {position}: {result:?}"
            );
        }
    }

    #[test]
    fn algorithm_mismatch_is_reported() {
        let bytes = sample().encode().unwrap();
        assert!(matches!(
            Snapshot::decode(&bytes, 1, Some(DigestAlgorithm::Blake3), 64),
            Err(CoreError::AlgorithmMismatch { .. })
        ));
    }
}
