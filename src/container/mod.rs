//! The underlying container codec: named records appended sequentially.
//!
//! # Layout
//! ```text
//! [ superblock ][ record header | body ][ record header | body ] ...
//! ```
//! The superblock is reserved at offset 0 and patched on [`ContainerWriter::finish`].
//! Each record header is written before its body with zeroed sizes, the body
//! is streamed (optionally compressed by the container), then the header is
//! patched in place.  Nothing else in the file points at a record: readers
//! find records by scanning forward from the superblock.
//!
//! # Out-of-band extra blob
//! Every record may carry up to 64 KiB of "extra" bytes inside its header.
//! They are covered by the header CRC and can be read without touching the
//! body.  The archive layer uses this to mark its directory record.

use std::io::{self, Read, Seek, SeekFrom, Take, Write};
use crc32fast::Hasher;
use thiserror::Error;

use crate::codec::{decoder, CodecError, CodecId, CodecWriter};
use crate::error::{closed_stream, Error, Result};
use crate::record::RecordHeader;
use crate::stage::StageDescriptor;
use crate::stream::{ChainOutput, StageRead, StageWrite};
use crate::superblock::{Superblock, SUPERBLOCK_SIZE};

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Invalid magic number")]
    InvalidMagic,
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("Invalid record magic {0:#010x}")]
    InvalidRecordMagic(u32),
    #[error("Header checksum mismatch in {0}")]
    HeaderChecksum(String),
    #[error("Payload checksum mismatch in record {0}")]
    PayloadChecksum(String),
    #[error("Record uses unknown codec {uuid}")]
    UnknownCodec { uuid: String },
    #[error("Record name is not valid UTF-8")]
    InvalidName,
    #[error("Record {field} too long ({len} bytes)")]
    FieldTooLong { field: &'static str, len: usize },
    #[error("Record {0} extends past end of file")]
    Truncated(String),
    #[error("Record {name} decodes to {actual} bytes, header says {expected}")]
    SizeMismatch { name: String, expected: u64, actual: u64 },
    #[error("Container already finished")]
    Finished,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct ContainerWriter<W: Write + Seek> {
    writer:         W,
    pub superblock: Superblock,
    finished:       bool,
}

impl<W: Write + Seek> ContainerWriter<W> {
    pub fn new(mut writer: W) -> Result<Self> {
        writer.seek(SeekFrom::Start(0)).map_err(ContainerError::from)?;
        writer.write_all(&[0u8; SUPERBLOCK_SIZE]).map_err(ContainerError::from)?; // patched on finish
        Ok(Self {
            writer,
            superblock: Superblock::new(),
            finished:   false,
        })
    }

    /// Write a record header and return a writer for its body.  The header
    /// is patched with final sizes when the returned writer is finished.
    pub fn begin_record(
        &mut self,
        name:  &str,
        extra: &[u8],
        codec: CodecId,
        level: i32,
    ) -> Result<RecordWriter<'_, W>> {
        if self.finished {
            return Err(ContainerError::Finished.into());
        }
        let header     = RecordHeader::new(name, extra, codec)?;
        let header_pos = self.writer.stream_position().map_err(ContainerError::from)?;
        header.write(&mut self.writer)?;
        self.superblock.record_count += 1;

        let sink = HashingWriter { inner: &mut self.writer, crc: Hasher::new(), count: 0 };
        Ok(RecordWriter {
            enc: Some(CodecWriter::new(codec, level, sink).map_err(ContainerError::from)?),
            header,
            header_pos,
            orig_size: 0,
        })
    }

    /// Store `data` as one complete record.
    pub fn write_record(
        &mut self,
        name:  &str,
        extra: &[u8],
        codec: CodecId,
        level: i32,
        data:  &[u8],
    ) -> Result<RecordHeader> {
        let mut record = self.begin_record(name, extra, codec, level)?;
        record.write_all(data).map_err(ContainerError::from)?;
        record.finish_record()
    }

    /// Patch the superblock at offset 0.  Idempotent.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        let end = self.writer.stream_position().map_err(ContainerError::from)?;
        self.writer.seek(SeekFrom::Start(0)).map_err(ContainerError::from)?;
        self.superblock.write(&mut self.writer)?;
        self.writer.seek(SeekFrom::Start(end)).map_err(ContainerError::from)?;
        self.writer.flush().map_err(ContainerError::from)?;
        self.finished = true;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Counts and checksums the bytes physically stored for one record.
pub struct HashingWriter<'a, W: Write> {
    inner: &'a mut W,
    crc:   Hasher,
    count: u64,
}

impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Body writer for one record.  This is the innermost stage of every
/// entry write pipeline.
pub struct RecordWriter<'a, W: Write + Seek> {
    enc:        Option<CodecWriter<HashingWriter<'a, W>>>,
    header:     RecordHeader,
    header_pos: u64,
    orig_size:  u64,
}

impl<W: Write + Seek> RecordWriter<'_, W> {
    pub fn name(&self) -> &str {
        &self.header.name
    }

    /// Flush the body, patch the header in place and return it.
    pub fn finish_record(&mut self) -> Result<RecordHeader> {
        let enc  = self.enc.take().ok_or_else(|| Error::logic("record already finished"))?;
        let sink = enc.finish().map_err(ContainerError::from)?;
        let HashingWriter { inner, crc, count } = sink;

        self.header.orig_size   = self.orig_size;
        self.header.stored_size = count;
        self.header.payload_crc = crc.finalize();

        let end = inner.stream_position().map_err(ContainerError::from)?;
        inner.seek(SeekFrom::Start(self.header_pos)).map_err(ContainerError::from)?;
        self.header.write(&mut *inner)?;
        inner.seek(SeekFrom::Start(end)).map_err(ContainerError::from)?;
        Ok(self.header.clone())
    }
}

impl<W: Write + Seek> Write for RecordWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let enc = self.enc.as_mut().ok_or_else(closed_stream)?;
        let n = enc.write(buf)?;
        self.orig_size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.enc.as_mut() {
            Some(enc) => enc.flush(),
            None      => Ok(()),
        }
    }
}

impl<W: Write + Seek> StageWrite for RecordWriter<'_, W> {
    fn finish(&mut self) -> Result<ChainOutput> {
        let record = self.finish_record()?;
        Ok(ChainOutput { stages: Vec::<StageDescriptor>::new(), record })
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// A record header plus where its body lives.
#[derive(Debug, Clone)]
pub struct RecordEntry {
    pub header:      RecordHeader,
    pub body_offset: u64,
}

pub struct ContainerReader<R: Read + Seek> {
    reader:         R,
    pub superblock: Superblock,
    next_offset:    u64,
    end:            u64,
}

impl<R: Read + Seek> ContainerReader<R> {
    pub fn open(mut reader: R) -> Result<Self> {
        reader.seek(SeekFrom::Start(0)).map_err(ContainerError::from)?;
        let superblock = Superblock::read(&mut reader)?;
        let end = reader.seek(SeekFrom::End(0)).map_err(ContainerError::from)?;
        Ok(Self {
            reader,
            superblock,
            next_offset: SUPERBLOCK_SIZE as u64,
            end,
        })
    }

    /// Read the next record header in storage order, skipping the body of
    /// the previous one.  Returns `None` at end of file.
    pub fn next_record(&mut self) -> Result<Option<RecordEntry>> {
        if self.next_offset >= self.end {
            return Ok(None);
        }
        self.reader.seek(SeekFrom::Start(self.next_offset)).map_err(ContainerError::from)?;
        let header      = RecordHeader::read(&mut self.reader)?;
        let body_offset = self.next_offset + header.encoded_len() as u64;
        let next = match body_offset.checked_add(header.stored_size) {
            Some(next) if next <= self.end => next,
            _ => return Err(ContainerError::Truncated(header.name).into()),
        };
        self.next_offset = next;
        Ok(Some(RecordEntry { header, body_offset }))
    }

    /// Scan forward to the record stored under `name`.
    pub fn find(&mut self, name: &str) -> Result<Option<RecordEntry>> {
        while let Some(entry) = self.next_record()? {
            if entry.header.name == name {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Read and decode a whole record body, verifying its CRC.
    pub fn read_body(&mut self, entry: &RecordEntry) -> Result<Vec<u8>> {
        let header = &entry.header;
        self.reader.seek(SeekFrom::Start(entry.body_offset)).map_err(ContainerError::from)?;
        // Sizes come from disk: let the read itself bound the allocation.
        let mut stored = Vec::new();
        (&mut self.reader)
            .take(header.stored_size)
            .read_to_end(&mut stored)
            .map_err(ContainerError::from)?;
        if stored.len() as u64 != header.stored_size {
            return Err(ContainerError::Truncated(header.name.clone()).into());
        }

        let mut hasher = Hasher::new();
        hasher.update(&stored);
        if hasher.finalize() != header.payload_crc {
            return Err(ContainerError::PayloadChecksum(header.name.clone()).into());
        }

        let mut out = Vec::new();
        decoder(header.codec, &stored[..])
            .map_err(ContainerError::from)?
            .read_to_end(&mut out)
            .map_err(ContainerError::from)?;
        if out.len() as u64 != header.orig_size {
            return Err(ContainerError::SizeMismatch {
                name:     header.name.clone(),
                expected: header.orig_size,
                actual:   out.len() as u64,
            }
            .into());
        }
        Ok(out)
    }

    /// Turn this reader into a stream over one record's stored bytes.
    /// Container-level decompression is left to the caller.
    pub fn into_body(mut self, entry: &RecordEntry) -> Result<RecordBody<R>> {
        self.reader.seek(SeekFrom::Start(entry.body_offset)).map_err(ContainerError::from)?;
        Ok(RecordBody {
            inner:    self.reader.take(entry.header.stored_size),
            name:     entry.header.name.clone(),
            expected: entry.header.payload_crc,
            crc:      Hasher::new(),
            failed:   false,
            verified: false,
            closed:   false,
        })
    }
}

/// Raw stored bytes of one record.  The payload CRC is checked when the
/// end of the body is reached; a mismatch fails that read and the later
/// [`StageRead::close`].
pub struct RecordBody<R: Read> {
    inner:    Take<R>,
    name:     String,
    expected: u32,
    crc:      Hasher,
    failed:   bool,
    verified: bool,
    closed:   bool,
}

impl<R: Read> Read for RecordBody<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed_stream());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.crc.update(&buf[..n]);
            return Ok(n);
        }
        if !self.verified {
            self.verified = true;
            if self.inner.limit() > 0 {
                self.failed = true;
                return Err(Error::integrity(format!("record {} is truncated", self.name)).into());
            }
            if self.crc.clone().finalize() != self.expected {
                self.failed = true;
                return Err(Error::from(ContainerError::PayloadChecksum(self.name.clone())).into());
            }
        }
        Ok(0)
    }
}

impl<R: Read> StageRead for RecordBody<R> {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::logic("stream already closed"));
        }
        self.closed = true;
        if self.failed {
            return Err(ContainerError::PayloadChecksum(self.name.clone()).into());
        }
        Ok(())
    }
}
