//! The redo log a shard writes to while a background split is copying
//! its data into fresh children.
//!
//! The redo log's own internal format is an external collaborator's
//! concern; this module provides the minimal trait a shard needs
//! (`put`/`delput`/`max_key`/`sync`/`destroy`/`iterate`) plus a
//! concrete, ordered, file-backed implementation so the crate is
//! runnable end to end. Modeled on the write-ahead-log framing in the
//! teacher's log payload module: a length-prefixed record stream
//! replayed in full on open, kept ordered in memory with a `BTreeMap`
//! because draining it in key order is part of its contract (a split
//! replays the log against the routed child in key order), not an
//! incidental property of whatever index happens to be convenient.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const RECORD_PUT: u8 = 1;
const RECORD_DEL: u8 = 2;

/// One entry replayed from the log, in key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoEntry {
    /// A put or overwrite.
    Put(Vec<u8>, u64),
    /// A delete.
    Del(Vec<u8>),
}

/// What a shard needs from its redo log during a split.
pub trait RedoLog {
    /// Appends a put record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn put(&mut self, key: &[u8], value: u64) -> Result<()>;

    /// Appends a delete record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn delput(&mut self, key: &[u8]) -> Result<()>;

    /// Greatest key with a live (non-deleted) entry in the log, if any.
    fn max_key(&self) -> Option<Vec<u8>>;

    /// Flushes buffered records to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn sync(&mut self) -> Result<()>;

    /// Removes the log's backing storage entirely.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing file cannot be removed.
    fn destroy(self) -> Result<()>;

    /// Returns every live entry in ascending key order.
    fn iterate(&self) -> Vec<RedoEntry>;
}

/// A file-backed [`RedoLog`]: each call appends a framed record, and
/// every record is replayed into an in-memory ordered map on open so
/// `iterate`/`max_key` never need to re-scan the file.
pub struct FileRedoLog {
    path: PathBuf,
    writer: BufWriter<File>,
    index: BTreeMap<Vec<u8>, Option<u64>>,
}

impl FileRedoLog {
    /// Creates a fresh, empty redo log at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file already exists or cannot be created.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            index: BTreeMap::new(),
        })
    }

    /// Opens an existing redo log and replays it into memory.
    ///
    /// # Errors
    ///
    /// Returns `Error::CorruptShard` if the file is truncated mid-record.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let index = replay(&bytes, &path)?;
        let writer = BufWriter::new(OpenOptions::new().append(true).open(&path)?);
        Ok(Self {
            path,
            writer,
            index,
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn replay(bytes: &[u8], path: &Path) -> Result<BTreeMap<Vec<u8>, Option<u64>>> {
    let display = path.to_string_lossy().into_owned();
    let mut index = BTreeMap::new();
    let mut cursor = 0usize;
    while cursor < bytes.len() {
        if cursor + 1 > bytes.len() {
            return Err(Error::CorruptShard(display, "truncated record tag".into()));
        }
        let tag = bytes[cursor];
        cursor += 1;
        let key = read_framed(bytes, &mut cursor, &display)?;
        match tag {
            RECORD_PUT => {
                let value = read_u64(bytes, &mut cursor, &display)?;
                index.insert(key, Some(value));
            }
            RECORD_DEL => {
                index.insert(key, None);
            }
            other => {
                return Err(Error::CorruptShard(
                    display,
                    format!("unknown redo record tag {other}"),
                ));
            }
        }
    }
    Ok(index)
}

fn read_framed(bytes: &[u8], cursor: &mut usize, path: &str) -> Result<Vec<u8>> {
    if *cursor + 4 > bytes.len() {
        return Err(Error::CorruptShard(
            path.to_string(),
            "truncated record length".into(),
        ));
    }
    let len = u32::from_le_bytes(bytes[*cursor..*cursor + 4].try_into().unwrap()) as usize;
    *cursor += 4;
    if *cursor + len > bytes.len() {
        return Err(Error::CorruptShard(
            path.to_string(),
            "truncated record payload".into(),
        ));
    }
    let out = bytes[*cursor..*cursor + len].to_vec();
    *cursor += len;
    Ok(out)
}

fn read_u64(bytes: &[u8], cursor: &mut usize, path: &str) -> Result<u64> {
    if *cursor + 8 > bytes.len() {
        return Err(Error::CorruptShard(
            path.to_string(),
            "truncated record value".into(),
        ));
    }
    let value = u64::from_le_bytes(bytes[*cursor..*cursor + 8].try_into().unwrap());
    *cursor += 8;
    Ok(value)
}

fn write_framed(writer: &mut impl Write, bytes: &[u8]) -> Result<()> {
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}

impl RedoLog for FileRedoLog {
    fn put(&mut self, key: &[u8], value: u64) -> Result<()> {
        self.writer.write_all(&[RECORD_PUT])?;
        write_framed(&mut self.writer, key)?;
        self.writer.write_all(&value.to_le_bytes())?;
        self.index.insert(key.to_vec(), Some(value));
        Ok(())
    }

    fn delput(&mut self, key: &[u8]) -> Result<()> {
        self.writer.write_all(&[RECORD_DEL])?;
        write_framed(&mut self.writer, key)?;
        self.index.insert(key.to_vec(), None);
        Ok(())
    }

    fn max_key(&self) -> Option<Vec<u8>> {
        self.index
            .iter()
            .rev()
            .find(|(_, v)| v.is_some())
            .map(|(k, _)| k.clone())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    fn destroy(mut self) -> Result<()> {
        self.writer.flush()?;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    fn iterate(&self) -> Vec<RedoEntry> {
        self.index
            .iter()
            .map(|(k, v)| match v {
                Some(value) => RedoEntry::Put(k.clone(), *value),
                None => RedoEntry::Del(k.clone()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_and_del_are_ordered_by_key_not_insertion() {
        let dir = tempdir().unwrap();
        let mut log = FileRedoLog::create(dir.path().join("s.redo")).unwrap();
        log.put(b"c", 3).unwrap();
        log.put(b"a", 1).unwrap();
        log.delput(b"b").unwrap();
        let entries = log.iterate();
        assert_eq!(
            entries,
            vec![
                RedoEntry::Put(b"a".to_vec(), 1),
                RedoEntry::Del(b"b".to_vec()),
                RedoEntry::Put(b"c".to_vec(), 3),
            ]
        );
    }

    #[test]
    fn later_record_for_same_key_wins() {
        let dir = tempdir().unwrap();
        let mut log = FileRedoLog::create(dir.path().join("s.redo")).unwrap();
        log.put(b"k", 10).unwrap();
        log.put(b"k", 20).unwrap();
        assert_eq!(log.iterate(), vec![RedoEntry::Put(b"k".to_vec(), 20)]);
    }

    #[test]
    fn max_key_ignores_deleted_entries() {
        let dir = tempdir().unwrap();
        let mut log = FileRedoLog::create(dir.path().join("s.redo")).unwrap();
        log.put(b"a", 1).unwrap();
        log.put(b"z", 2).unwrap();
        log.delput(b"z").unwrap();
        assert_eq!(log.max_key(), Some(b"a".to_vec()));
    }

    #[test]
    fn reopen_replays_all_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.redo");
        {
            let mut log = FileRedoLog::create(&path).unwrap();
            log.put(b"a", 1).unwrap();
            log.delput(b"a").unwrap();
            log.put(b"b", 2).unwrap();
            log.sync().unwrap();
        }
        let log = FileRedoLog::open(&path).unwrap();
        assert_eq!(log.iterate(), vec![RedoEntry::Put(b"b".to_vec(), 2)]);
    }

    #[test]
    fn destroy_removes_backing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.redo");
        let log = FileRedoLog::create(&path).unwrap();
        log.destroy().unwrap();
        assert!(!path.exists());
    }
}
