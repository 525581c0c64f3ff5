//! Container file header, written at offset 0 and patched on finish.
//!
//! ```text
//! magic (4) | version u32 | archive uuid (16) | flags u32 | record_count u64 | crc32 u32
//! ```
//! All integers little-endian.  The CRC covers every preceding byte.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use std::io::{Read, Write};
use uuid::Uuid;

use crate::container::ContainerError;

pub const MAGIC: &[u8; 4] = b"SEAL";
pub const VERSION: u32 = 1;
pub const SUPERBLOCK_SIZE: usize = 4 + 4 + 16 + 4 + 8 + 4;

/// Set when the archive carries an encrypted directory record.
/// Diagnostic only: readers trust the record marker, not this bit.
pub const SB_FLAG_ENCRYPTED: u32 = 1 << 0;

#[derive(Debug, Clone)]
pub struct Superblock {
    pub version:      u32,
    pub archive_uuid: Uuid,
    pub flags:        u32,
    pub record_count: u64,
}

impl Default for Superblock {
    fn default() -> Self {
        Self::new()
    }
}

impl Superblock {
    pub fn new() -> Self {
        Self {
            version:      VERSION,
            archive_uuid: Uuid::new_v4(),
            flags:        0,
            record_count: 0,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & SB_FLAG_ENCRYPTED != 0
    }

    fn body(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SUPERBLOCK_SIZE);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(self.archive_uuid.as_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.record_count.to_le_bytes());
        buf
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<(), ContainerError> {
        let body = self.body();
        let mut hasher = Hasher::new();
        hasher.update(&body);
        writer.write_all(&body)?;
        writer.write_u32::<LittleEndian>(hasher.finalize())?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, ContainerError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ContainerError::InvalidMagic);
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(ContainerError::UnsupportedVersion(version));
        }
        let mut uuid_bytes = [0u8; 16];
        reader.read_exact(&mut uuid_bytes)?;
        let flags        = reader.read_u32::<LittleEndian>()?;
        let record_count = reader.read_u64::<LittleEndian>()?;
        let stored_crc   = reader.read_u32::<LittleEndian>()?;

        let sb = Self {
            version,
            archive_uuid: Uuid::from_bytes(uuid_bytes),
            flags,
            record_count,
        };
        let mut hasher = Hasher::new();
        hasher.update(&sb.body());
        if hasher.finalize() != stored_crc {
            return Err(ContainerError::HeaderChecksum("superblock".into()));
        }
        Ok(sb)
    }
}
