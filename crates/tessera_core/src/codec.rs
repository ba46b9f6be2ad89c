//! Little-endian field readers and writers shared by the file formats.

use crate::checksum::Digest;
use crate::error::{CoreError, CoreResult};
use crate::types::{ElementId, PartitionId};

/// Cursor over an encoded buffer.
///
/// Every read checks bounds and reports `InvalidFormat` naming the field
/// that ran past the end.
#[derive(Debug)]
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn bytes(&mut self, len: usize, field: &str) -> CoreResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(CoreError::invalid_format(format!(
                "unexpected end of data reading {field} ({len} bytes at offset {})",
                self.pos
            )));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn array<const N: usize>(&mut self, field: &str) -> CoreResult<[u8; N]> {
        let slice = self.bytes(N, field)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub(crate) fn u8(&mut self, field: &str) -> CoreResult<u8> {
        Ok(self.array::<1>(field)?[0])
    }

    pub(crate) fn u16(&mut self, field: &str) -> CoreResult<u16> {
        Ok(u16::from_le_bytes(self.array(field)?))
    }

    pub(crate) fn u32(&mut self, field: &str) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(self.array(field)?))
    }

    pub(crate) fn u64(&mut self, field: &str) -> CoreResult<u64> {
        Ok(u64::from_le_bytes(self.array(field)?))
    }

    pub(crate) fn i64(&mut self, field: &str) -> CoreResult<i64> {
        Ok(i64::from_le_bytes(self.array(field)?))
    }

    pub(crate) fn digest(&mut self, field: &str) -> CoreResult<Digest> {
        Ok(Digest::from_bytes(self.array(field)?))
    }

    pub(crate) fn element_id(&mut self, field: &str) -> CoreResult<ElementId> {
        Ok(ElementId::from_bytes(self.array(field)?))
    }

    /// Reads a `u32` length followed by that many bytes.
    pub(crate) fn blob(&mut self, field: &str) -> CoreResult<&'a [u8]> {
        let len = self.u32(field)? as usize;
        self.bytes(len, field)
    }

    /// Reads a `u16` length followed by UTF-8 text.
    pub(crate) fn short_str(&mut self, field: &str) -> CoreResult<String> {
        let len = usize::from(self.u16(field)?);
        let raw = self.bytes(len, field)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| CoreError::invalid_format(format!("{field} is not valid UTF-8")))
    }

    pub(crate) fn partition_id(&mut self, field: &str) -> CoreResult<PartitionId> {
        let name = self.short_str(field)?;
        PartitionId::new(name)
            .map_err(|_| CoreError::invalid_format(format!("{field} is not a valid partition id")))
    }

    /// Fails if unread bytes remain.
    pub(crate) fn finish(&self, what: &str) -> CoreResult<()> {
        if self.remaining() != 0 {
            return Err(CoreError::invalid_format(format!(
                "trailing bytes in {what}: {} unread",
                self.remaining()
            )));
        }
        Ok(())
    }
}

pub(crate) fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Writes a `u32` length prefix and the bytes.
pub(crate) fn put_blob(buf: &mut Vec<u8>, data: &[u8]) -> CoreResult<()> {
    let len = u32::try_from(data.len()).map_err(|_| {
        CoreError::encoding(format!("blob of {} bytes exceeds u32 length", data.len()))
    })?;
    put_u32(buf, len);
    buf.extend_from_slice(data);
    Ok(())
}

/// Writes a `u16` length prefix and the UTF-8 bytes.
pub(crate) fn put_short_str(buf: &mut Vec<u8>, text: &str) -> CoreResult<()> {
    let len = u16::try_from(text.len())
        .map_err(|_| CoreError::encoding(format!("string of {} bytes too long", text.len())))?;
    put_u16(buf, len);
    buf.extend_from_slice(text.as_bytes());
    Ok(())
}
