//! Tree metadata record.

use bytes::{Buf, BufMut, BytesMut};
use std::path::Path;

use betula_common::{BetulaError, Result};

/// Magic bytes identifying a Betula metadata file ("BETU").
const META_MAGIC: u32 = 0x4245_5455;

/// Filename of the metadata record inside a tree's data directory.
pub(crate) const META_FILE: &str = "betree.meta";

/// Persistent tree header: everything needed to reopen a tree directory.
///
/// Layout (32 bytes):
/// - magic: 4 bytes
/// - root: 8 bytes (node id of the root)
/// - next_timestamp: 8 bytes
/// - next_node_id: 8 bytes
/// - checksum: 4 bytes (CRC32 of the preceding 28 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MetaRecord {
    pub root: u64,
    pub next_timestamp: u64,
    pub next_node_id: u64,
}

impl MetaRecord {
    /// Size of the record on disk.
    pub const SIZE: usize = 32;

    /// Serializes the record to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(META_MAGIC);
        buf.put_u64_le(self.root);
        buf.put_u64_le(self.next_timestamp);
        buf.put_u64_le(self.next_node_id);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf.to_vec()
    }

    /// Deserializes a record from bytes, verifying magic and checksum.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(BetulaError::MetaCorrupted(format!(
                "expected {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }

        let stored_checksum = (&bytes[Self::SIZE - 4..]).get_u32_le();
        let computed_checksum = crc32fast::hash(&bytes[..Self::SIZE - 4]);
        if stored_checksum != computed_checksum {
            return Err(BetulaError::MetaCorrupted(format!(
                "checksum mismatch: stored={}, computed={}",
                stored_checksum, computed_checksum
            )));
        }

        let mut data = bytes;
        let magic = data.get_u32_le();
        if magic != META_MAGIC {
            return Err(BetulaError::MetaCorrupted(format!(
                "bad magic: {:#010x}",
                magic
            )));
        }

        Ok(Self {
            root: data.get_u64_le(),
            next_timestamp: data.get_u64_le(),
            next_node_id: data.get_u64_le(),
        })
    }

    /// Writes the record to the given path.
    pub fn store(&self, path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = std::fs::File::create(path)?;
        file.write_all(&self.to_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Reads a record back from the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}
