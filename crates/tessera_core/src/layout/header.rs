//! Log file header.
//!
//! ```text
//! 0..4    magic "TSHD"
//! 4..6    format version
//! 6       digest algorithm
//! 7       reserved
//! 8..12   slot capacity N
//! 12..16  crc32 over bytes 0..12 and 16..24
//! 16..24  generation
//! 24..32  tip word: offset of the last published block, 0 = none
//! 32..40  flags word
//! 40..    N slots of (element id 16, latest offset 8)
//! ```
//!
//! The tip, flag and slot words are the only bytes of a log that are ever
//! overwritten. Each is 8-byte aligned and written with a single write.

use crate::checksum::{Crc32, DigestAlgorithm};
use crate::codec::ByteReader;
use crate::error::{CoreError, CoreResult};
use crate::types::ElementId;
use std::collections::HashMap;

/// Magic bytes identifying a log file.
pub const HEADER_MAGIC: [u8; 4] = *b"TSHD";

/// Current header format version.
pub const HEADER_VERSION: u16 = 1;

/// Size of the fixed part of the header.
pub const HEADER_FIXED: u64 = 40;

/// Size of one slot.
pub const SLOT_SIZE: u64 = 24;

/// Position of the tip word.
pub const TIP_POSITION: u64 = 24;

/// Position of the flags word.
pub const FLAGS_POSITION: u64 = 32;

/// Slot offset marking an unused slot.
pub const SLOT_EMPTY: u64 = 0;

/// Slot offset marking an element that lives only in the snapshot.
pub const SLOT_IN_SNAPSHOT: u64 = 1;

/// Flag: the log must be forward-scanned and its slots rebuilt on open.
pub const FLAG_NEEDS_REPAIR: u64 = 1;

/// In-memory copy of a log header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Digest algorithm of every record in the file.
    pub algorithm: DigestAlgorithm,
    /// Number of slots.
    pub capacity: u32,
    /// Generation this log belongs to.
    pub generation: u64,
    /// Offset of the last published block (0 = none).
    pub tip: u64,
    /// Flag bits.
    pub flags: u64,
    slots: Vec<Option<(ElementId, u64)>>,
    index: HashMap<ElementId, usize>,
}

impl Header {
    /// Creates a header with all slots empty.
    #[must_use]
    pub fn new(algorithm: DigestAlgorithm, capacity: u32, generation: u64) -> Self {
        Self {
            algorithm,
            capacity,
            generation,
            tip: 0,
            flags: 0,
            slots: vec![None; capacity as usize],
            index: HashMap::new(),
        }
    }

    /// Total header size for `capacity` slots.
    #[must_use]
    pub const fn size_for(capacity: u32) -> u64 {
        HEADER_FIXED + SLOT_SIZE * capacity as u64
    }

    /// Total size of this header.
    #[must_use]
    pub const fn size(&self) -> u64 {
        Self::size_for(self.capacity)
    }

    /// File position of slot `index`.
    #[must_use]
    pub const fn slot_position(index: usize) -> u64 {
        HEADER_FIXED + SLOT_SIZE * index as u64
    }

    /// Returns true if the repair flag is set.
    #[must_use]
    pub const fn needs_repair(&self) -> bool {
        self.flags & FLAG_NEEDS_REPAIR != 0
    }

    /// Returns the slot index holding `id`.
    #[must_use]
    pub fn find(&self, id: &ElementId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Returns the latest offset recorded for `id`.
    #[must_use]
    pub fn latest(&self, id: &ElementId) -> Option<u64> {
        self.find(id).and_then(|i| self.slots[i]).map(|(_, offset)| offset)
    }

    /// Number of claimed slots.
    #[must_use]
    pub fn used(&self) -> usize {
        self.index.len()
    }

    /// Returns the lowest free slot index.
    #[must_use]
    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    /// Returns the indices of the `n` lowest free slots.
    #[must_use]
    pub fn free_slots(&self, n: usize) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .take(n)
            .collect()
    }

    /// Iterates over claimed slots as `(index, element, offset)`.
    pub fn claimed(&self) -> impl Iterator<Item = (usize, ElementId, u64)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|(id, off)| (i, id, off)))
    }

    /// Sets slot `index` in memory.
    pub fn set_slot(&mut self, index: usize, slot: Option<(ElementId, u64)>) {
        if let Some((old, _)) = self.slots[index] {
            self.index.remove(&old);
        }
        if let Some((id, _)) = slot {
            self.index.insert(id, index);
        }
        self.slots[index] = slot;
    }

    /// Encodes a slot.
    #[must_use]
    pub fn encode_slot(slot: Option<(ElementId, u64)>) -> [u8; 24] {
        let mut out = [0u8; 24];
        if let Some((id, offset)) = slot {
            out[..16].copy_from_slice(id.as_bytes());
            out[16..].copy_from_slice(&offset.to_le_bytes());
        }
        out
    }

    fn crc(fixed: &[u8]) -> u32 {
        let mut crc = Crc32::new();
        crc.update(&fixed[0..12]);
        crc.update(&fixed[16..24]);
        crc.finish()
    }

    /// Encodes the whole header.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size() as usize);
        buf.extend_from_slice(&HEADER_MAGIC);
        buf.extend_from_slice(&HEADER_VERSION.to_le_bytes());
        buf.push(self.algorithm.as_byte());
        buf.push(0);
        buf.extend_from_slice(&self.capacity.to_le_bytes());
        buf.extend_from_slice(&[0; 4]);
        buf.extend_from_slice(&self.generation.to_le_bytes());
        buf.extend_from_slice(&self.tip.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        let crc = Self::crc(&buf);
        buf[12..16].copy_from_slice(&crc.to_le_bytes());
        for slot in &self.slots {
            buf.extend_from_slice(&Self::encode_slot(*slot));
        }
        buf
    }

    /// Decodes the fixed part, returning a header with empty slots.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` on a bad magic, version, algorithm or crc.
    pub fn decode_fixed(bytes: &[u8]) -> CoreResult<Self> {
        let mut r = ByteReader::new(bytes);
        if r.bytes(4, "header magic")? != HEADER_MAGIC {
            return Err(CoreError::invalid_format("not a tessera log (bad header magic)"));
        }
        let version = r.u16("header version")?;
        if version != HEADER_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported header version {version}"
            )));
        }
        let alg = r.u8("algorithm")?;
        let algorithm = DigestAlgorithm::from_byte(alg)
            .ok_or_else(|| CoreError::invalid_format(format!("unknown digest algorithm {alg}")))?;
        r.u8("reserved")?;
        let capacity = r.u32("capacity")?;
        let stored_crc = r.u32("header crc")?;
        let generation = r.u64("generation")?;
        let tip = r.u64("tip")?;
        let flags = r.u64("flags")?;

        let computed = Self::crc(bytes);
        if stored_crc != computed {
            return Err(CoreError::invalid_format(format!(
                "header crc mismatch: stored {stored_crc:08x}, computed {computed:08x}"
            )));
        }
        let mut header = Self::new(algorithm, capacity, generation);
        header.tip = tip;
        header.flags = flags;
        Ok(header)
    }

    /// Decodes a complete header including slots.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the fixed part is invalid or the slot
    /// table is truncated.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let mut header = Self::decode_fixed(bytes)?;
        let size = header.size() as usize;
        if bytes.len() < size {
            return Err(CoreError::invalid_format(format!(
                "header needs {size} bytes, file has {}",
                bytes.len()
            )));
        }
        let mut r = ByteReader::new(&bytes[HEADER_FIXED as usize..size]);
        for index in 0..header.capacity as usize {
            let id = r.element_id("slot element")?;
            let offset = r.u64("slot offset")?;
            if offset != SLOT_EMPTY {
                header.set_slot(index, Some((id, offset)));
            }
        }
        Ok(header)
    }
}
