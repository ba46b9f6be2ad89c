//! Log blocks.
//!
//! ```text
//! magic "TBLK" | block_len u32 | flags u8 | link_count u32 |
//! links (element_id 16, prev_offset u64)* | links crc32 | commit record
//! ```
//!
//! Links chain each touched element back to the block that last changed it,
//! so an element's history can be walked without scanning the log. The crc
//! covers everything before it; the commit record protects itself with its
//! own id.

use crate::checksum::crc32;
use crate::codec::{put_u32, put_u64, ByteReader};
use crate::error::{CoreError, CoreResult};
use crate::types::ElementId;
use tessera_storage::StorageBackend;

/// Magic bytes identifying a block.
pub const BLOCK_MAGIC: [u8; 4] = *b"TBLK";

/// Flag: the block was appended by this replica (not imported).
pub const BLOCK_FLAG_MAINLINE: u8 = 1;

/// Bytes needed to learn a block's length.
pub const BLOCK_PREFIX: usize = 8;

/// A backward pointer for one element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    /// The element.
    pub element: ElementId,
    /// Offset of the element's previous block, or a slot marker.
    pub previous: u64,
}

/// A framed commit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Whether the block is on this replica's own line of history.
    pub mainline: bool,
    /// Backward links, one per touched element.
    pub links: Vec<Link>,
    /// The serialized commit record.
    pub record: Vec<u8>,
}

impl Block {
    /// A mainline block.
    #[must_use]
    pub fn mainline(links: Vec<Link>, record: Vec<u8>) -> Self {
        Self {
            mainline: true,
            links,
            record,
        }
    }

    /// A block holding an imported commit.
    #[must_use]
    pub fn imported(record: Vec<u8>) -> Self {
        Self {
            mainline: false,
            links: Vec::new(),
            record,
        }
    }

    /// Serializes the block.
    ///
    /// # Errors
    ///
    /// Returns an encoding error if the block exceeds `u32` length.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(17 + self.links.len() * 24 + self.record.len());
        buf.extend_from_slice(&BLOCK_MAGIC);
        put_u32(&mut buf, 0);
        buf.push(if self.mainline { BLOCK_FLAG_MAINLINE } else { 0 });
        let count = u32::try_from(self.links.len())
            .map_err(|_| CoreError::encoding("too many block links"))?;
        put_u32(&mut buf, count);
        for link in &self.links {
            buf.extend_from_slice(link.element.as_bytes());
            put_u64(&mut buf, link.previous);
        }
        let total = u32::try_from(buf.len() + 4 + self.record.len())
            .map_err(|_| CoreError::encoding("block too large"))?;
        buf[4..8].copy_from_slice(&total.to_le_bytes());
        let crc = crc32(&buf);
        put_u32(&mut buf, crc);
        buf.extend_from_slice(&self.record);
        Ok(buf)
    }

    /// Reads the length from a block prefix.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the magic is wrong.
    pub fn peek_len(prefix: &[u8]) -> CoreResult<u32> {
        let mut r = ByteReader::new(prefix);
        if r.bytes(4, "block magic")? != BLOCK_MAGIC {
            return Err(CoreError::invalid_format("bad block magic"));
        }
        r.u32("block length")
    }

    /// Decodes a complete block.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` on bad framing or a links crc mismatch.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let len = Self::peek_len(bytes)? as usize;
        if len != bytes.len() {
            return Err(CoreError::invalid_format(format!(
                "block length {len} does not match {} bytes",
                bytes.len()
            )));
        }
        let mut r = ByteReader::new(bytes);
        r.bytes(BLOCK_PREFIX, "block prefix")?;
        let flags = r.u8("block flags")?;
        let count = r.u32("link count")? as usize;
        let mut links = Vec::with_capacity(count.min(r.remaining() / 24));
        for _ in 0..count {
            let element = r.element_id("link element")?;
            let previous = r.u64("link offset")?;
            links.push(Link { element, previous });
        }
        let crc_at = r.position();
        let stored = r.u32("links crc")?;
        if stored != crc32(&bytes[..crc_at]) {
            return Err(CoreError::invalid_format("block links crc mismatch"));
        }
        let record = bytes[r.position()..].to_vec();
        Ok(Self {
            mainline: flags & BLOCK_FLAG_MAINLINE != 0,
            links,
            record,
        })
    }

    /// Reads the block at `offset`, refusing to read past `end`.
    ///
    /// Returns the block and its length.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the block is malformed or crosses `end`,
    /// or a storage error.
    pub fn read_at(backend: &dyn StorageBackend, offset: u64, end: u64) -> CoreResult<(Self, u64)> {
        if offset + BLOCK_PREFIX as u64 > end {
            return Err(CoreError::invalid_format(format!(
                "block at {offset} runs past end {end}"
            )));
        }
        let prefix = backend.read_at(offset, BLOCK_PREFIX)?;
        let len = u64::from(Self::peek_len(&prefix)?);
        if len < BLOCK_PREFIX as u64 || offset + len > end {
            return Err(CoreError::invalid_format(format!(
                "block at {offset} with length {len} runs past end {end}"
            )));
        }
        let bytes = backend.read_at(offset, len as usize)?;
        Ok((Self::decode(&bytes)?, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_storage::InMemoryBackend;

    fn sample() -> Block {
        Block::mainline(
            vec![
                Link {
                    element: ElementId::from_bytes([1; 16]),
                    previous: 0,
                },
                Link {
                    element: ElementId::from_bytes([2; 16]),
                    previous: 1,
                },
            ],
            b"TCMT-record-bytes".to_vec(),
        )
    }

    #[test]
    fn decode_matches_encode() {
        let block = sample();
        let bytes = block.encode().unwrap();
        assert_eq!(Block::peek_len(&bytes).unwrap() as usize, bytes.len());
        assert_eq!(Block::decode(&bytes).unwrap(), block);

        let imported = Block::imported(b"x".to_vec());
        assert!(!Block::decode(&imported.encode().unwrap()).unwrap().mainline);
    }

    #[test]
    fn damaged_link_fails_crc() {
        let mut bytes = sample().encode().unwrap();
        bytes[20] ^= 0x10;
        assert!(Block::decode(&bytes).is_err());
    }

    #[test]
    fn read_at_respects_end() {
        let bytes = sample().encode().unwrap();
        let mut backend = InMemoryBackend::new();
        backend.append(&bytes).unwrap();
        let end = bytes.len() as u64;
        let (block, len) = Block::read_at(&backend, 0, end).unwrap();
        assert_eq!(len, end);
        assert_eq!(block, sample());
        assert!(Block::read_at(&backend, 0, end - 1).is_err());
    }
}
