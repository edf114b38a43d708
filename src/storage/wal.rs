//! Write-ahead log sidecar: every mutation is appended here before it is
//! considered durable, so a crash between a mutation and the next `save()`
//! can be replayed on reopen instead of losing data (spec §3, §8 scenario 2).
//!
//! Entry layout: `[op:1][id:16][len:4][data][slot_offset:8][data_offset:8]
//! [timestamp:8]`, followed by a 4-byte CRC over everything before it.

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const OP_ADD: u8 = 0;
const OP_REMOVE: u8 = 1;
const OP_UPDATE: u8 = 2;

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// One replayed mutation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WalEntry {
    Add { id: u128, data: Vec<u8> },
    Update { id: u128, data: Vec<u8> },
    Remove { id: u128 },
}

/// Append-only log of [`WalEntry`] values, CRC-checked on replay.
pub(crate) struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Wal {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    fn append_record(&mut self, op: u8, id: u128, data: &[u8], slot_offset: u64, data_offset: u64) -> io::Result<()> {
        let mut record = Vec::with_capacity(1 + 16 + 4 + data.len() + 8 + 8 + 8);
        record.push(op);
        record.extend_from_slice(&id.to_le_bytes());
        record.extend_from_slice(&(data.len() as u32).to_le_bytes());
        record.extend_from_slice(data);
        record.extend_from_slice(&slot_offset.to_le_bytes());
        record.extend_from_slice(&data_offset.to_le_bytes());
        record.extend_from_slice(&now_secs().to_le_bytes());

        let crc = crc32(&record);
        self.writer.write_all(&record)?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.flush()
    }

    /// Logs a brand-new record landing at `slot_offset`/`data_offset`.
    pub fn append_add(&mut self, id: u128, data: &[u8], slot_offset: u64, data_offset: u64) -> io::Result<()> {
        self.append_record(OP_ADD, id, data, slot_offset, data_offset)
    }

    /// Logs an in-place replacement whose new extent lands at `slot_offset`/`data_offset`.
    pub fn append_update(&mut self, id: u128, data: &[u8], slot_offset: u64, data_offset: u64) -> io::Result<()> {
        self.append_record(OP_UPDATE, id, data, slot_offset, data_offset)
    }

    /// Logs a tombstone of the slot at `slot_offset`, whose data extent was at `data_offset`.
    pub fn append_delete(&mut self, id: u128, slot_offset: u64, data_offset: u64) -> io::Result<()> {
        self.append_record(OP_REMOVE, id, &[], slot_offset, data_offset)
    }

    /// Truncates the WAL to empty. Called after a clean `save()`, since the
    /// durable state is now fully reflected in the index/data files.
    pub fn truncate(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        let file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }

    /// Replays every well-formed entry in the WAL at `path`, in order. Stops
    /// (without erroring) at the first truncated or CRC-mismatched record,
    /// since that marks an in-progress append interrupted by a crash.
    pub fn replay(path: impl AsRef<Path>) -> Result<Vec<WalEntry>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();

        loop {
            let mut marker = [0u8; 1];
            if reader.read_exact(&mut marker).is_err() {
                break;
            }
            let mut id_bytes = [0u8; 16];
            if reader.read_exact(&mut id_bytes).is_err() {
                break;
            }
            let id = u128::from_le_bytes(id_bytes);

            let op = marker[0];
            if op != OP_ADD && op != OP_REMOVE && op != OP_UPDATE {
                tracing::warn!(marker = op, "WAL replay: unknown op, stopping");
                break;
            }

            let mut len_bytes = [0u8; 4];
            if reader.read_exact(&mut len_bytes).is_err() {
                break;
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            let mut data = vec![0u8; len];
            if reader.read_exact(&mut data).is_err() {
                break;
            }
            let mut tail = [0u8; 24];
            if reader.read_exact(&mut tail).is_err() {
                break;
            }
            let mut crc_bytes = [0u8; 4];
            if reader.read_exact(&mut crc_bytes).is_err() {
                break;
            }
            let stored_crc = u32::from_le_bytes(crc_bytes);

            let mut buf = Vec::with_capacity(1 + 16 + 4 + len + 24);
            buf.push(op);
            buf.extend_from_slice(&id_bytes);
            buf.extend_from_slice(&len_bytes);
            buf.extend_from_slice(&data);
            buf.extend_from_slice(&tail);
            if crc32(&buf) != stored_crc {
                tracing::warn!(id, "WAL replay: CRC mismatch, truncating replay here");
                break;
            }

            entries.push(match op {
                OP_ADD => WalEntry::Add { id, data },
                OP_UPDATE => WalEntry::Update { id, data },
                _ => WalEntry::Remove { id },
            });
        }

        Ok(entries)
    }
}

/// CRC-32 (IEEE 802.3 polynomial), computed with a const-evaluated table.
fn crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let idx = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ TABLE[idx];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_add_update_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_add(1, b"hello", 32, 32).unwrap();
            wal.append_add(2, b"world", 64, 37).unwrap();
            wal.append_update(1, b"hello!", 32, 42).unwrap();
            wal.append_delete(2, 64, 37).unwrap();
        }
        let entries = Wal::replay(&path).unwrap();
        assert_eq!(
            entries,
            vec![
                WalEntry::Add { id: 1, data: b"hello".to_vec() },
                WalEntry::Add { id: 2, data: b"world".to_vec() },
                WalEntry::Update { id: 1, data: b"hello!".to_vec() },
                WalEntry::Remove { id: 2 },
            ]
        );
    }

    #[test]
    fn truncated_tail_is_discarded_not_errored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_add(1, b"hello", 32, 32).unwrap();
        }
        // Corrupt the tail to simulate a crash mid-append.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 2);
        std::fs::write(&path, &bytes).unwrap();

        let entries = Wal::replay(&path).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn truncate_clears_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append_add(1, b"hello", 32, 32).unwrap();
        wal.truncate().unwrap();
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn missing_file_replays_empty() {
        let entries = Wal::replay("/nonexistent/path.wal").unwrap();
        assert!(entries.is_empty());
    }
}
