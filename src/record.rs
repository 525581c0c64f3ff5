//! Self-describing container record header.
//!
//! ```text
//! magic u32 | name_len u16 | extra_len u16 | codec uuid (16)
//! | orig_size u64 | stored_size u64 | payload_crc u32 | header_crc u32
//! | name (name_len bytes, UTF-8) | extra (extra_len bytes)
//! ```
//! All integers little-endian.  `header_crc` covers every other header byte,
//! including name and extra, so the out-of-band extra blob can be trusted
//! without touching the body.  `payload_crc` covers the stored body bytes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use std::io::{Read, Write};

use crate::codec::{uuid_to_string, CodecId};
use crate::container::ContainerError;

pub const RECORD_MAGIC: u32 = 0x4452_4352; // "RCRD"
pub const RECORD_FIXED_SIZE: usize = 4 + 2 + 2 + 16 + 8 + 8 + 4 + 4;
pub const MAX_NAME_LEN:  usize = u16::MAX as usize;
pub const MAX_EXTRA_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub name:        String,
    pub extra:       Vec<u8>,
    pub codec:       CodecId,
    /// Bytes fed into the record before container-level compression.
    pub orig_size:   u64,
    /// Bytes physically stored after the header.
    pub stored_size: u64,
    pub payload_crc: u32,
}

impl RecordHeader {
    pub fn new(name: &str, extra: &[u8], codec: CodecId) -> Result<Self, ContainerError> {
        if name.len() > MAX_NAME_LEN {
            return Err(ContainerError::FieldTooLong { field: "name", len: name.len() });
        }
        if extra.len() > MAX_EXTRA_LEN {
            return Err(ContainerError::FieldTooLong { field: "extra", len: extra.len() });
        }
        Ok(Self {
            name:        name.to_owned(),
            extra:       extra.to_vec(),
            codec,
            orig_size:   0,
            stored_size: 0,
            payload_crc: 0,
        })
    }

    /// Total on-disk size of this header.
    pub fn encoded_len(&self) -> usize {
        RECORD_FIXED_SIZE + self.name.len() + self.extra.len()
    }

    fn header_crc(&self) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&RECORD_MAGIC.to_le_bytes());
        hasher.update(&(self.name.len() as u16).to_le_bytes());
        hasher.update(&(self.extra.len() as u16).to_le_bytes());
        hasher.update(&self.codec.uuid());
        hasher.update(&self.orig_size.to_le_bytes());
        hasher.update(&self.stored_size.to_le_bytes());
        hasher.update(&self.payload_crc.to_le_bytes());
        hasher.update(self.name.as_bytes());
        hasher.update(&self.extra);
        hasher.finalize()
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<(), ContainerError> {
        writer.write_u32::<LittleEndian>(RECORD_MAGIC)?;
        writer.write_u16::<LittleEndian>(self.name.len() as u16)?;
        writer.write_u16::<LittleEndian>(self.extra.len() as u16)?;
        writer.write_all(&self.codec.uuid())?;
        writer.write_u64::<LittleEndian>(self.orig_size)?;
        writer.write_u64::<LittleEndian>(self.stored_size)?;
        writer.write_u32::<LittleEndian>(self.payload_crc)?;
        writer.write_u32::<LittleEndian>(self.header_crc())?;
        writer.write_all(self.name.as_bytes())?;
        writer.write_all(&self.extra)?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> Result<Self, ContainerError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != RECORD_MAGIC {
            return Err(ContainerError::InvalidRecordMagic(magic));
        }
        let name_len  = reader.read_u16::<LittleEndian>()? as usize;
        let extra_len = reader.read_u16::<LittleEndian>()? as usize;
        let mut uuid = [0u8; 16];
        reader.read_exact(&mut uuid)?;
        let orig_size   = reader.read_u64::<LittleEndian>()?;
        let stored_size = reader.read_u64::<LittleEndian>()?;
        let payload_crc = reader.read_u32::<LittleEndian>()?;
        let stored_crc  = reader.read_u32::<LittleEndian>()?;

        let mut name = vec![0u8; name_len];
        reader.read_exact(&mut name)?;
        let mut extra = vec![0u8; extra_len];
        reader.read_exact(&mut extra)?;

        let codec = CodecId::from_uuid(&uuid).ok_or_else(|| ContainerError::UnknownCodec {
            uuid: uuid_to_string(&uuid),
        })?;
        let name = String::from_utf8(name)
            .map_err(|_| ContainerError::InvalidName)?;

        let header = Self { name, extra, codec, orig_size, stored_size, payload_crc };
        if header.header_crc() != stored_crc {
            return Err(ContainerError::HeaderChecksum(header.name));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RecordHeader {
        let mut h = RecordHeader::new("00000001", b"SVRFabc", CodecId::Zstd).unwrap();
        h.orig_size   = 1234;
        h.stored_size = 99;
        h.payload_crc = 0xDEAD_BEEF;
        h
    }

    #[test]
    fn header_reads_back() {
        let h = sample();
        let mut buf = Vec::new();
        h.write(&mut buf).unwrap();
        assert_eq!(buf.len(), h.encoded_len());
        assert_eq!(RecordHeader::read(&buf[..]).unwrap(), h);
    }

    #[test]
    fn flipped_extra_byte_fails_header_crc() {
        let h = sample();
        let mut buf = Vec::new();
        h.write(&mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x20;
        assert!(matches!(RecordHeader::read(&buf[..]), Err(ContainerError::HeaderChecksum(_))));
    }

    #[test]
    fn oversized_name_is_rejected() {
        let long = "n".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            RecordHeader::new(&long, &[], CodecId::None),
            Err(ContainerError::FieldTooLong { field: "name", .. })
        ));
    }
}
