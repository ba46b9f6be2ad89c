//! Log files: a fixed header followed by appended blocks.
//!
//! # Append protocol
//!
//! 1. Refuse with `HeaderFull` if new elements do not fit the slot table.
//! 2. Append the block and sync it.
//! 3. Update the slot of every touched element (new elements: id first,
//!    then the offset word).
//! 4. Write the tip word. This single aligned write publishes the block.
//!
//! On failure the tail is truncated and the append retried once. If the
//! retry fails too, the repair flag is set and `AppendFailed` returned.
//!
//! # Recovery
//!
//! On open, if the repair flag is set, bytes follow the tip block, or the
//! slots disagree with the published blocks, the unpublished tail is cut
//! off and the slots are rebuilt from a forward scan. A crash anywhere
//! before step 4 therefore reopens to the pre-append state.

use super::block::{Block, Link};
use super::header::{
    Header, FLAGS_POSITION, FLAG_NEEDS_REPAIR, HEADER_FIXED, SLOT_EMPTY, SLOT_IN_SNAPSHOT,
    TIP_POSITION,
};
use crate::checksum::DigestAlgorithm;
use crate::error::{CoreError, CoreResult};
use crate::types::{ElementId, PartitionId};
use std::collections::BTreeMap;
use tessera_storage::StorageBackend;
use tracing::{debug, warn};

/// A block found by a forward scan.
#[derive(Debug, Clone)]
pub struct ScannedBlock {
    /// File offset of the block.
    pub offset: u64,
    /// Block length in bytes.
    pub len: u64,
    /// The block.
    pub block: Block,
}

/// Everything a read-only pass over a log learns.
#[derive(Debug, Clone)]
pub struct LogScan {
    /// The header as stored.
    pub header: Header,
    /// Published blocks in file order.
    pub blocks: Vec<ScannedBlock>,
    /// End of the last published block.
    pub end: u64,
    /// Current file size.
    pub size: u64,
    /// First framing failure inside the published region.
    pub broken: Option<(u64, String)>,
    /// Whether the tip word pointed at a readable block.
    pub tip_valid: bool,
}

impl LogScan {
    /// Reads a log without modifying it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the header is unreadable, or a storage
    /// error.
    pub fn read(backend: &dyn StorageBackend) -> CoreResult<Self> {
        let size = backend.size()?;
        if size < HEADER_FIXED {
            return Err(CoreError::invalid_format(format!(
                "log of {size} bytes is shorter than its header"
            )));
        }
        let fixed = Header::decode_fixed(&backend.read_at(0, HEADER_FIXED as usize)?)?;
        let header_size = fixed.size();
        if size < header_size {
            return Err(CoreError::invalid_format(format!(
                "log of {size} bytes is shorter than its {header_size}-byte header"
            )));
        }
        let header = Header::decode(&backend.read_at(0, header_size as usize)?)?;

        let (limit, tip_valid) = if header.tip == 0 {
            (header_size, true)
        } else if header.tip < header_size {
            (size, false)
        } else {
            match Block::read_at(backend, header.tip, size) {
                Ok((_, len)) => (header.tip + len, true),
                Err(_) => (size, false),
            }
        };

        let mut blocks = Vec::new();
        let mut broken = None;
        let mut pos = header_size;
        while pos < limit {
            match Block::read_at(backend, pos, limit) {
                Ok((block, len)) => {
                    blocks.push(ScannedBlock {
                        offset: pos,
                        len,
                        block,
                    });
                    pos += len;
                }
                Err(e) => {
                    if tip_valid {
                        broken = Some((pos, e.to_string()));
                    }
                    break;
                }
            }
        }
        let end = if tip_valid { limit } else { pos };

        Ok(Self {
            header,
            blocks,
            end,
            size,
            broken,
            tip_valid,
        })
    }

    /// Slot values the published blocks imply: snapshot-resident slots are
    /// kept, and every element linked from a mainline block points at the
    /// last such block.
    #[must_use]
    pub fn expected_slots(&self) -> BTreeMap<ElementId, u64> {
        let mut expected: BTreeMap<ElementId, u64> = self
            .header
            .claimed()
            .filter(|(_, _, offset)| *offset == SLOT_IN_SNAPSHOT)
            .map(|(_, id, offset)| (id, offset))
            .collect();
        for scanned in self.blocks.iter().filter(|b| b.block.mainline) {
            for link in &scanned.block.links {
                expected.insert(link.element, scanned.offset);
            }
        }
        expected
    }

    /// Returns true if opening this log must run a repair.
    ///
    /// Framing damage inside the published region is never repaired here;
    /// cutting the log there would drop published commits.
    #[must_use]
    pub fn needs_repair(&self) -> bool {
        if self.broken.is_some() {
            return false;
        }
        if self.header.needs_repair() || !self.tip_valid || self.size > self.end {
            return true;
        }
        let actual: BTreeMap<ElementId, u64> =
            self.header.claimed().map(|(_, id, off)| (id, off)).collect();
        actual != self.expected_slots()
    }
}

/// An open, writable log.
pub struct LogFile {
    backend: Box<dyn StorageBackend>,
    header: Header,
    partition: String,
    end: u64,
    sync: bool,
}

impl std::fmt::Debug for LogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFile")
            .field("partition", &self.partition)
            .field("generation", &self.header.generation)
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}

impl LogFile {
    /// Writes a fresh log, replacing whatever the backend held.
    ///
    /// `resident` elements get their slots claimed as snapshot-resident.
    ///
    /// # Errors
    ///
    /// Returns `HeaderFull` if `resident` exceeds `capacity`, or a storage
    /// error.
    pub fn create(
        mut backend: Box<dyn StorageBackend>,
        partition: &PartitionId,
        algorithm: DigestAlgorithm,
        capacity: u32,
        generation: u64,
        resident: &[ElementId],
        sync: bool,
    ) -> CoreResult<Self> {
        if resident.len() > capacity as usize {
            return Err(CoreError::HeaderFull {
                partition: partition.to_string(),
                capacity,
            });
        }
        let mut header = Header::new(algorithm, capacity, generation);
        for (index, id) in resident.iter().enumerate() {
            header.set_slot(index, Some((*id, SLOT_IN_SNAPSHOT)));
        }
        backend.truncate(0)?;
        backend.append(&header.encode())?;
        backend.sync()?;
        Ok(Self {
            end: header.size(),
            backend,
            header,
            partition: partition.to_string(),
            sync,
        })
    }

    /// Opens a log, repairing it if needed, and returns its published blocks.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the header is unreadable or the slots
    /// cannot be rebuilt, or a storage error.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        partition: &PartitionId,
        sync: bool,
    ) -> CoreResult<(Self, LogScan)> {
        let scan = LogScan::read(backend.as_ref())?;
        let mut log = Self {
            backend,
            header: scan.header.clone(),
            partition: partition.to_string(),
            end: scan.end,
            sync,
        };
        if let Some((offset, message)) = &scan.broken {
            warn!(partition = %partition, offset, %message, "damaged block in published log");
        } else if scan.needs_repair() {
            log.repair(&scan)?;
        }
        Ok((log, scan))
    }

    fn repair(&mut self, scan: &LogScan) -> CoreResult<()> {
        warn!(
            partition = %self.partition,
            generation = self.header.generation,
            published_end = scan.end,
            file_size = scan.size,
            "repairing log"
        );
        if scan.size > scan.end {
            self.backend.truncate(scan.end)?;
        }

        let expected = scan.expected_slots();
        if expected.len() > self.header.capacity as usize {
            return Err(CoreError::invalid_format(format!(
                "log references {} elements but has {} slots",
                expected.len(),
                self.header.capacity
            )));
        }

        let current: Vec<(usize, ElementId, u64)> = self.header.claimed().collect();
        for (index, id, offset) in current {
            match expected.get(&id) {
                Some(want) if *want == offset => {}
                Some(want) => self.write_slot(index, Some((id, *want)))?,
                None => self.write_slot(index, None)?,
            }
        }
        for (id, offset) in &expected {
            if self.header.find(id).is_none() {
                let index = self.header.free_slot().ok_or_else(|| {
                    CoreError::invalid_format("no free slot while rebuilding header")
                })?;
                self.write_slot(index, Some((*id, *offset)))?;
            }
        }

        let tip = scan.blocks.last().map_or(0, |b| b.offset);
        if tip != self.header.tip {
            self.backend.write_at(TIP_POSITION, &tip.to_le_bytes())?;
            self.header.tip = tip;
        }
        self.end = scan.end;
        self.backend.sync()?;
        self.backend.write_at(FLAGS_POSITION, &0u64.to_le_bytes())?;
        self.backend.sync()?;
        self.header.flags = 0;
        Ok(())
    }

    fn write_slot(&mut self, index: usize, slot: Option<(ElementId, u64)>) -> CoreResult<()> {
        let position = Header::slot_position(index);
        match slot {
            Some((id, offset)) => {
                self.backend.write_at(position, id.as_bytes())?;
                self.backend.write_at(position + 16, &offset.to_le_bytes())?;
            }
            None => {
                self.backend.write_at(position + 16, &SLOT_EMPTY.to_le_bytes())?;
                self.backend.write_at(position, &[0u8; 16])?;
            }
        }
        self.header.set_slot(index, slot);
        Ok(())
    }

    /// Returns the header.
    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Returns the end of the last published block.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Returns the latest block offset of an element, [`SLOT_IN_SNAPSHOT`]
    /// if it only lives in the snapshot, or `None` if untracked.
    #[must_use]
    pub fn locate(&self, id: &ElementId) -> Option<u64> {
        self.header.latest(id)
    }

    /// Reads the published block at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if no valid block starts there.
    pub fn read_block(&self, offset: u64) -> CoreResult<Block> {
        Ok(Block::read_at(self.backend.as_ref(), offset, self.end)?.0)
    }

    /// Returns the blocks that changed `id`, newest first, by following
    /// backward links from its slot.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if a link is missing or does not point
    /// backwards.
    pub fn element_blocks(&self, id: &ElementId) -> CoreResult<Vec<(u64, Block)>> {
        let mut out = Vec::new();
        let mut offset = self.locate(id).unwrap_or(SLOT_EMPTY);
        while offset > SLOT_IN_SNAPSHOT {
            let block = self.read_block(offset)?;
            let previous = block
                .links
                .iter()
                .find(|l| l.element == *id)
                .map(|l| l.previous)
                .ok_or_else(|| {
                    CoreError::invalid_format(format!("block at {offset} has no link for {id}"))
                })?;
            if previous >= offset {
                return Err(CoreError::invalid_format(format!(
                    "link for {id} at {offset} points forward to {previous}"
                )));
            }
            out.push((offset, block));
            offset = previous;
        }
        Ok(out)
    }

    /// Appends a commit record and publishes it.
    ///
    /// Mainline blocks link and update the slots of `touched`; imported
    /// blocks touch no slots.
    ///
    /// # Errors
    ///
    /// Returns `HeaderFull` (nothing written) if new elements do not fit,
    /// or `AppendFailed` if the append fails twice.
    pub fn append(&mut self, record: Vec<u8>, mainline: bool, touched: &[ElementId]) -> CoreResult<u64> {
        let mut new_elements: Vec<ElementId> = Vec::new();
        if mainline {
            for id in touched {
                if self.header.find(id).is_none() && !new_elements.contains(id) {
                    new_elements.push(*id);
                }
            }
        }
        if self.header.used() + new_elements.len() > self.header.capacity as usize {
            return Err(CoreError::HeaderFull {
                partition: self.partition.clone(),
                capacity: self.header.capacity,
            });
        }
        let claims: Vec<(usize, ElementId)> = self
            .header
            .free_slots(new_elements.len())
            .into_iter()
            .zip(new_elements)
            .collect();

        let links: Vec<Link> = if mainline {
            touched
                .iter()
                .map(|id| Link {
                    element: *id,
                    previous: self.header.latest(id).unwrap_or(SLOT_EMPTY),
                })
                .collect()
        } else {
            Vec::new()
        };
        let block = Block {
            mainline,
            links,
            record,
        };
        let bytes = block.encode()?;
        let offset = self.end;

        if let Err(first) = self.write_block(offset, &bytes, &block.links, &claims) {
            warn!(partition = %self.partition, offset, error = %first, "append failed, retrying");
            let retry = self
                .backend
                .truncate(offset)
                .map_err(CoreError::from)
                .and_then(|()| self.write_block(offset, &bytes, &block.links, &claims));
            if let Err(second) = retry {
                self.mark_needs_repair();
                return Err(CoreError::append_failed(self.partition.clone(), second.to_string()));
            }
        }

        for link in &block.links {
            let index = match self.header.find(&link.element) {
                Some(index) => index,
                None => match claims.iter().find(|(_, id)| *id == link.element) {
                    Some((index, _)) => *index,
                    None => continue,
                },
            };
            self.header.set_slot(index, Some((link.element, offset)));
        }
        self.header.tip = offset;
        self.end = offset + bytes.len() as u64;
        debug!(partition = %self.partition, offset, mainline, "block published");
        Ok(offset)
    }

    fn write_block(
        &mut self,
        offset: u64,
        bytes: &[u8],
        links: &[Link],
        claims: &[(usize, ElementId)],
    ) -> CoreResult<()> {
        if self.backend.size()? > offset {
            self.backend.truncate(offset)?;
        }
        self.backend.append(bytes)?;
        if self.sync {
            self.backend.sync()?;
        }
        for (index, id) in claims {
            self.backend.write_at(Header::slot_position(*index), id.as_bytes())?;
        }
        for link in links {
            let index = self
                .header
                .find(&link.element)
                .or_else(|| claims.iter().find(|(_, id)| *id == link.element).map(|(i, _)| *i));
            if let Some(index) = index {
                self.backend
                    .write_at(Header::slot_position(index) + 16, &offset.to_le_bytes())?;
            }
        }
        if self.sync {
            self.backend.sync()?;
        }
        self.backend.write_at(TIP_POSITION, &offset.to_le_bytes())?;
        if self.sync {
            self.backend.sync()?;
        }
        Ok(())
    }

    fn mark_needs_repair(&mut self) {
        self.header.flags |= FLAG_NEEDS_REPAIR;
        let flagged = self
            .backend
            .write_at(FLAGS_POSITION, &self.header.flags.to_le_bytes())
            .and_then(|()| self.backend.sync());
        if let Err(e) = flagged {
            warn!(partition = %self.partition, error = %e, "could not set repair flag");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_storage::InMemoryBackend;

    fn pid() -> PartitionId {
        PartitionId::new("inbox").unwrap()
    }

    fn id(n: u8) -> ElementId {
        ElementId::from_bytes([n; 16])
    }

    fn fresh(capacity: u32) -> (InMemoryBackend, LogFile) {
        let backend = InMemoryBackend::new();
        let log = LogFile::create(
            Box::new(backend.clone()),
            &pid(),
            DigestAlgorithm::Sha256,
            capacity,
            0,
            &[],
            true,
        )
        .unwrap();
        (backend, log)
    }

    #[test]
    fn append_updates_slots_and_tip() {
        let (backend, mut log) = fresh(4);
        let first = log.append(b"r1".to_vec(), true, &[id(1), id(2)]).unwrap();
        let second = log.append(b"r2".to_vec(), true, &[id(1)]).unwrap();
        assert_eq!(log.locate(&id(1)), Some(second));
        assert_eq!(log.locate(&id(2)), Some(first));

        let (reopened, scan) = LogFile::open(Box::new(backend), &pid(), true).unwrap();
        assert_eq!(scan.blocks.len(), 2);
        assert!(!scan.needs_repair());
        assert_eq!(reopened.header().tip, second);
        assert_eq!(reopened.locate(&id(1)), Some(second));
    }

    #[test]
    fn element_blocks_follow_links() {
        let (_, mut log) = fresh(4);
        let a = log.append(b"a".to_vec(), true, &[id(1)]).unwrap();
        log.append(b"b".to_vec(), true, &[id(2)]).unwrap();
        let c = log.append(b"c".to_vec(), true, &[id(1)]).unwrap();
        let offsets: Vec<u64> = log
            .element_blocks(&id(1))
            .unwrap()
            .into_iter()
            .map(|(o, _)| o)
            .collect();
        assert_eq!(offsets, vec![c, a]);
    }

    #[test]
    fn header_full_writes_nothing() {
        let (backend, mut log) = fresh(2);
        log.append(b"a".to_vec(), true, &[id(1), id(2)]).unwrap();
        let size = backend.data().len();
        let err = log.append(b"b".to_vec(), true, &[id(3)]).unwrap_err();
        assert!(matches!(err, CoreError::HeaderFull { capacity: 2, .. }));
        assert_eq!(backend.data().len(), size);
        log.append(b"c".to_vec(), true, &[id(1)]).unwrap();
    }

    #[test]
    fn imported_blocks_leave_slots_alone() {
        let (_, mut log) = fresh(1);
        let offset = log.append(b"foreign".to_vec(), false, &[id(7)]).unwrap();
        assert_eq!(log.header().used(), 0);
        assert_eq!(log.header().tip, offset);
    }

    #[test]
    fn unpublished_tail_is_discarded_on_open() {
        let (backend, mut log) = fresh(4);
        log.append(b"kept".to_vec(), true, &[id(1)]).unwrap();
        let published = backend.data();

        // Simulate a crash after the data and slot writes but before the tip.
        let mut raw = backend.clone();
        let stray = Block::mainline(vec![], b"lost".to_vec()).encode().unwrap();
        let offset = raw.append(&stray).unwrap();
        raw.write_at(Header::slot_position(1), id(2).as_bytes()).unwrap();
        raw.write_at(Header::slot_position(1) + 16, &offset.to_le_bytes())
            .unwrap();

        let (reopened, scan) = LogFile::open(Box::new(backend.clone()), &pid(), true).unwrap();
        assert!(scan.needs_repair());
        assert_eq!(scan.blocks.len(), 1);
        assert_eq!(reopened.locate(&id(2)), None);
        assert_eq!(backend.data(), published);
    }

    #[test]
    fn resident_slots_survive_repair() {
        let backend = InMemoryBackend::new();
        let mut log = LogFile::create(
            Box::new(backend.clone()),
            &pid(),
            DigestAlgorithm::Sha256,
            4,
            1,
            &[id(1), id(2)],
            true,
        )
        .unwrap();
        let offset = log.append(b"x".to_vec(), true, &[id(2)]).unwrap();
        let mut raw = backend.clone();
        raw.write_at(FLAGS_POSITION, &FLAG_NEEDS_REPAIR.to_le_bytes())
            .unwrap();

        let (reopened, _) = LogFile::open(Box::new(backend), &pid(), true).unwrap();
        assert!(!reopened.header().needs_repair());
        assert_eq!(reopened.locate(&id(1)), Some(SLOT_IN_SNAPSHOT));
        assert_eq!(reopened.locate(&id(2)), Some(offset));
    }

    #[test]
    fn too_many_residents_is_header_full() {
        let result = LogFile::create(
            Box::new(InMemoryBackend::new()),
            &pid(),
            DigestAlgorithm::Sha256,
            1,
            0,
            &[id(1), id(2)],
            true,
        );
        assert!(matches!(result, Err(CoreError::HeaderFull { .. })));
    }
}
