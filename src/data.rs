//! Data-file binary layout: the header and variable-length key records.
//!
//! Per spec §3.3, values live inline in the meta node (see
//! `meta::NodeView::value`); the data arena holds only key bytes, one
//! `DataRecord` per live or freed key. Each record's `back_offset` names
//! the meta node that owns it (spec invariant: a reachable node's data
//! offset points at a record whose back-offset equals the node's own
//! offset) — `skiplist.rs` uses this on load to tell a record that still
//! belongs to a live node from an orphaned one left behind by a delete.

use crate::error::{Error, Result};

/// Magic number identifying a data file.
pub const DATA_MAGIC: u32 = 0x534b_4454; // "SKDT"
/// On-disk format version.
pub const DATA_VERSION: u8 = 1;

/// Byte size of `DataHeader`.
pub const DATA_HEADER_SIZE: u64 = 24;

/// Byte size of a `DataRecord`'s fixed header, not counting its bytes.
pub const RECORD_HEADER_SIZE: u64 = 16;

/// The fixed-position header of a data file.
///
/// Layout (24 bytes): `magic:u32 version:u8 _pad:3 mapcap:u64 used:u64`
#[derive(Debug, Clone, Copy)]
pub struct DataHeader {
    /// Mapped capacity in bytes, mirrored from `Arena::capacity`.
    pub mapcap: u64,
    /// Byte offset of the next unused slot (bump allocator watermark).
    pub used: u64,
}

impl DataHeader {
    /// Reads the header from the start of `buf`.
    ///
    /// # Errors
    ///
    /// Returns `Error::CorruptShard` if the magic or version do not
    /// match, or `buf` is shorter than the header.
    pub fn read(buf: &[u8], path: &str) -> Result<Self> {
        if (buf.len() as u64) < DATA_HEADER_SIZE {
            return Err(Error::CorruptShard(
                path.to_string(),
                "data file shorter than header".into(),
            ));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let version = buf[4];
        if magic != DATA_MAGIC {
            return Err(Error::CorruptShard(
                path.to_string(),
                format!("bad data magic {magic:#x}"),
            ));
        }
        if version != DATA_VERSION {
            return Err(Error::CorruptShard(
                path.to_string(),
                format!("unsupported data version {version}"),
            ));
        }
        Ok(Self {
            mapcap: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            used: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        })
    }

    /// Writes the header to the start of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than the header.
    pub fn write(&self, buf: &mut [u8]) {
        assert!((buf.len() as u64) >= DATA_HEADER_SIZE);
        buf[0..4].copy_from_slice(&DATA_MAGIC.to_le_bytes());
        buf[4] = DATA_VERSION;
        buf[5..8].fill(0);
        buf[8..16].copy_from_slice(&self.mapcap.to_le_bytes());
        buf[16..24].copy_from_slice(&self.used.to_le_bytes());
    }

    /// Builds a fresh header for a newly created data file.
    #[must_use]
    pub fn new(mapcap: u64) -> Self {
        Self {
            mapcap,
            used: DATA_HEADER_SIZE,
        }
    }
}

/// Computes the on-disk size of a blob record holding `len` bytes.
#[must_use]
pub fn record_size(len: usize) -> u64 {
    RECORD_HEADER_SIZE + len as u64
}

/// Reads the byte slice for the blob at `offset`.
///
/// # Errors
///
/// Returns `Error::CorruptShard` if `offset` plus the declared length
/// does not fit within `buf`.
pub fn read_blob<'a>(buf: &'a [u8], offset: u64, path: &str) -> Result<&'a [u8]> {
    let header_end = offset
        .checked_add(RECORD_HEADER_SIZE)
        .ok_or_else(|| Error::CorruptShard(path.to_string(), "offset overflow".into()))?;
    if header_end > buf.len() as u64 {
        return Err(Error::CorruptShard(
            path.to_string(),
            format!("blob at {offset} out of bounds"),
        ));
    }
    let o = offset as usize;
    let len = u32::from_le_bytes(buf[o + 8..o + 12].try_into().unwrap()) as u64;
    let end = header_end
        .checked_add(len)
        .ok_or_else(|| Error::CorruptShard(path.to_string(), "blob length overflow".into()))?;
    if end > buf.len() as u64 {
        return Err(Error::CorruptShard(
            path.to_string(),
            format!("blob at {offset} length {len} out of bounds"),
        ));
    }
    Ok(&buf[header_end as usize..end as usize])
}

/// Reads the `back_offset` field of the blob at `offset`: the meta node
/// offset that owns it, used to validate spec invariant 7 during a scan.
///
/// # Errors
///
/// Returns `Error::CorruptShard` if `offset` is out of bounds.
pub fn read_back_offset(buf: &[u8], offset: u64, path: &str) -> Result<u64> {
    let end = offset
        .checked_add(8)
        .ok_or_else(|| Error::CorruptShard(path.to_string(), "offset overflow".into()))?;
    if end > buf.len() as u64 {
        return Err(Error::CorruptShard(
            path.to_string(),
            format!("blob at {offset} out of bounds"),
        ));
    }
    let o = offset as usize;
    Ok(u64::from_le_bytes(buf[o..o + 8].try_into().unwrap()))
}

/// Writes a blob record (`back_offset`, `bytes`) at `offset`. The
/// caller must have already `ensure_capacity`'d the arena.
///
/// # Panics
///
/// Panics if the record does not fit in `buf`.
pub fn write_blob(buf: &mut [u8], offset: u64, back_offset: u64, bytes: &[u8]) {
    let o = offset as usize;
    let end = o + RECORD_HEADER_SIZE as usize + bytes.len();
    assert!(end <= buf.len());
    buf[o..o + 8].copy_from_slice(&back_offset.to_le_bytes());
    buf[o + 8..o + 12].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf[o + 12..o + 16].fill(0);
    buf[o + 16..end].copy_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut buf = vec![0u8; DATA_HEADER_SIZE as usize];
        let h = DataHeader {
            mapcap: 1024,
            used: 48,
        };
        h.write(&mut buf);
        let back = DataHeader::read(&buf, "x").unwrap();
        assert_eq!(back.mapcap, 1024);
        assert_eq!(back.used, 48);
    }

    #[test]
    fn blob_roundtrip() {
        let mut buf = vec![0u8; 64];
        write_blob(&mut buf, 0, 0, b"hello");
        assert_eq!(read_blob(&buf, 0, "x").unwrap(), b"hello");
        assert_eq!(read_back_offset(&buf, 0, "x").unwrap(), 0);

        write_blob(&mut buf, 32, 0, b"world!");
        assert_eq!(read_blob(&buf, 32, "x").unwrap(), b"world!");
    }

    #[test]
    fn blob_out_of_bounds_is_corrupt() {
        let buf = vec![0u8; 8];
        assert!(read_blob(&buf, 0, "x").is_err());
    }
}
