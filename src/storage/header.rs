//! The 32-byte header shared by the index and data files (spec §3).

use crate::error::{Error, Result};

pub(crate) const MAGIC: &[u8; 4] = b"NMMF";
pub(crate) const CURRENT_VERSION: u32 = 1;
const HEADER_LEN: usize = 32;

/// Fixed-size header at the start of both the index file and the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileHeader {
    pub version: u32,
    pub created_at: u64,
    pub modified_at: u64,
}

impl FileHeader {
    pub fn new(now: u64) -> Self {
        Self {
            version: CURRENT_VERSION,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(MAGIC);
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.created_at.to_le_bytes());
        buf[16..24].copy_from_slice(&self.modified_at.to_le_bytes());
        // bytes 24..32 reserved, left zeroed
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::CorruptHeader("file shorter than header".into()));
        }
        if &bytes[0..4] != MAGIC {
            return Err(Error::CorruptHeader("bad magic".into()));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version > CURRENT_VERSION {
            return Err(Error::VersionUnsupported {
                found: version,
                supported: CURRENT_VERSION,
            });
        }
        let created_at = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let modified_at = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        Ok(Self {
            version,
            created_at,
            modified_at,
        })
    }

    pub const fn len() -> usize {
        HEADER_LEN
    }

    /// Rewrites `modified_at`, called on `save()` before re-flushing the header bytes.
    pub fn touch(&mut self, now: u64) {
        self.modified_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let header = FileHeader::new(1_700_000_000);
        let bytes = header.encode();
        let decoded = FileHeader::decode(&bytes).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = FileHeader::new(0).encode();
        bytes[0] = b'X';
        assert!(matches!(FileHeader::decode(&bytes), Err(Error::CorruptHeader(_))));
    }

    #[test]
    fn rejects_future_version() {
        let mut bytes = FileHeader::new(0).encode();
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            FileHeader::decode(&bytes),
            Err(Error::VersionUnsupported { found: 99, .. })
        ));
    }

    #[test]
    fn rejects_truncated() {
        let bytes = [0u8; 10];
        assert!(matches!(FileHeader::decode(&bytes), Err(Error::CorruptHeader(_))));
    }
}
