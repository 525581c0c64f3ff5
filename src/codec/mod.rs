//! Compression codec registry: frozen UUID identities + streaming adapters.
//!
//! # Identity rules
//! Every codec is identified by a 16-byte UUID.  That UUID is:
//!   - Written into every container record header on disk.
//!   - Used verbatim as the type-definition bytes of a `compress` stage.
//!
//! A reader that meets an unknown UUID MUST fail immediately; there is no
//! fallback to another codec.
//!
//! # Streaming
//! [`CodecWriter`] compresses while bytes flow through it and hands the inner
//! writer back from [`CodecWriter::finish`].  [`decoder`] wraps any reader.
//! LZMA has no streaming API in `lzma-rs`, so it buffers the whole entry:
//! the writer until `finish`, the reader from its first `read`.

use std::io::{self, Cursor, Read, Write};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Error as ArchiveError;

// ── Frozen codec UUIDs ──────────────────────────────────────────────────────
//
// These values are permanent.  A UUID is NEVER reused, even if a codec is
// deprecated.

/// No compression — payload stored verbatim.
pub const UUID_NONE:   [u8; 16] = [
    0x00,0x00,0x00,0x00,0x00,0x00,0x00,0x00,
    0x00,0x00,0x00,0x00,0x00,0x00,0x00,0x00,
];
/// Zstandard — balanced speed/ratio (default).
/// UUID: b28a9d4f-5e3c-4a1b-8f2e-7c6d9b0e1a2f  (LE bytes)
pub const UUID_ZSTD:   [u8; 16] = [
    0x4f,0x9d,0x8a,0xb2, 0x3c,0x5e, 0x1b,0x4a,
    0x8f,0x2e, 0x7c,0x6d,0x9b,0x0e,0x1a,0x2f,
];
/// LZ4 frame format — maximum throughput, lower ratio.
/// UUID: 3f7b2c8e-1a4d-4e9f-b6c3-5d8a2f7e0b1c  (LE bytes)
pub const UUID_LZ4:    [u8; 16] = [
    0x8e,0x2c,0x7b,0x3f, 0x4d,0x1a, 0x9f,0x4e,
    0xb6,0xc3, 0x5d,0x8a,0x2f,0x7e,0x0b,0x1c,
];
/// Brotli — high ratio, optimised for text content.
/// UUID: 9c1e5f3a-7b2d-4c8e-a5f1-2e6b9d0c3a7f  (LE bytes)
pub const UUID_BROTLI: [u8; 16] = [
    0x3a,0x5f,0x1e,0x9c, 0x2d,0x7b, 0x8e,0x4c,
    0xa5,0xf1, 0x2e,0x6b,0x9d,0x0c,0x3a,0x7f,
];
/// LZMA — highest ratio, slowest codec.
/// UUID: 4a8f2e1c-9b3d-4f7a-c2e8-6d5b1a0f3c9e  (LE bytes)
pub const UUID_LZMA:   [u8; 16] = [
    0x1c,0x2e,0x8f,0x4a, 0x3d,0x9b, 0x7a,0x4f,
    0xc2,0xe8, 0x6d,0x5b,0x1a,0x0f,0x3c,0x9e,
];

const BROTLI_BUFFER: usize = 4096;
const BROTLI_LGWIN:  u32   = 22;

// ── CodecId enum ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    None,
    Zstd,
    Lz4,
    Brotli,
    Lzma,
}

impl CodecId {
    /// Returns the frozen 16-byte UUID for this codec.
    #[inline]
    pub fn uuid(self) -> [u8; 16] {
        match self {
            CodecId::None   => UUID_NONE,
            CodecId::Zstd   => UUID_ZSTD,
            CodecId::Lz4    => UUID_LZ4,
            CodecId::Brotli => UUID_BROTLI,
            CodecId::Lzma   => UUID_LZMA,
        }
    }

    /// Resolve a UUID to a CodecId.
    /// Returns `None` if the UUID is not recognised by this build.
    pub fn from_uuid(uuid: &[u8; 16]) -> Option<Self> {
        match uuid {
            u if u == &UUID_NONE   => Some(CodecId::None),
            u if u == &UUID_ZSTD   => Some(CodecId::Zstd),
            u if u == &UUID_LZ4    => Some(CodecId::Lz4),
            u if u == &UUID_BROTLI => Some(CodecId::Brotli),
            u if u == &UUID_LZMA   => Some(CodecId::Lzma),
            _                      => None,
        }
    }

    /// Resolve stage type-definition bytes (must be exactly one UUID).
    pub fn from_def(def: &[u8]) -> Result<Self, CodecError> {
        let uuid: [u8; 16] = def.try_into().map_err(|_| CodecError::UnavailableCodec {
            uuid: hex::encode(def),
        })?;
        Self::from_uuid(&uuid).ok_or_else(|| CodecError::UnavailableCodec {
            uuid: uuid_to_string(&uuid),
        })
    }

    /// Human-readable name (for diagnostics only — never parsed from disk).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::None   => "none",
            CodecId::Zstd   => "zstd",
            CodecId::Lz4    => "lz4",
            CodecId::Brotli => "brotli",
            CodecId::Lzma   => "lzma",
        }
    }
}

/// Format a raw 16-byte UUID (LE field order) as `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`.
pub fn uuid_to_string(bytes: &[u8; 16]) -> String {
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        bytes[3],bytes[2],bytes[1],bytes[0],
        bytes[5],bytes[4],
        bytes[7],bytes[6],
        bytes[8],bytes[9],
        bytes[10],bytes[11],bytes[12],bytes[13],bytes[14],bytes[15],
    )
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    /// The UUID is formatted for display; decoding MUST NOT continue.
    #[error("Required codec not available (UUID {uuid}) — cannot decode without it")]
    UnavailableCodec { uuid: String },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Streaming encoder ────────────────────────────────────────────────────────

/// A compressing writer over `W`.
pub enum CodecWriter<W: Write> {
    None(W),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Lz4(lz4_flex::frame::FrameEncoder<W>),
    Brotli(Box<brotli::CompressorWriter<W>>),
    Lzma { buf: Vec<u8>, inner: W },
}

impl<W: Write> CodecWriter<W> {
    pub fn new(codec: CodecId, level: i32, inner: W) -> Result<Self, CodecError> {
        Ok(match codec {
            CodecId::None   => CodecWriter::None(inner),
            CodecId::Zstd   => CodecWriter::Zstd(
                zstd::stream::write::Encoder::new(inner, level)
                    .map_err(|e| CodecError::Compression(e.to_string()))?,
            ),
            CodecId::Lz4    => CodecWriter::Lz4(lz4_flex::frame::FrameEncoder::new(inner)),
            CodecId::Brotli => {
                let quality = level.clamp(0, 11) as u32;
                CodecWriter::Brotli(Box::new(brotli::CompressorWriter::new(
                    inner, BROTLI_BUFFER, quality, BROTLI_LGWIN,
                )))
            }
            CodecId::Lzma   => CodecWriter::Lzma { buf: Vec::new(), inner },
        })
    }

    /// Flush the codec trailer and return the inner writer.
    pub fn finish(self) -> Result<W, CodecError> {
        match self {
            CodecWriter::None(w) => Ok(w),
            CodecWriter::Zstd(enc) => enc
                .finish()
                .map_err(|e| CodecError::Compression(e.to_string())),
            CodecWriter::Lz4(enc) => enc
                .finish()
                .map_err(|e| CodecError::Compression(e.to_string())),
            CodecWriter::Brotli(mut enc) => {
                enc.flush()?;
                Ok((*enc).into_inner())
            }
            CodecWriter::Lzma { buf, mut inner } => {
                lzma_rs::lzma_compress(&mut Cursor::new(&buf[..]), &mut inner)
                    .map_err(|e| CodecError::Compression(e.to_string()))?;
                Ok(inner)
            }
        }
    }
}

impl<W: Write> Write for CodecWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CodecWriter::None(w)           => w.write(buf),
            CodecWriter::Zstd(enc)         => enc.write(buf),
            CodecWriter::Lz4(enc)          => enc.write(buf),
            CodecWriter::Brotli(enc)       => enc.write(buf),
            CodecWriter::Lzma { buf: b, .. } => {
                b.extend_from_slice(buf);
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CodecWriter::None(w)      => w.flush(),
            CodecWriter::Zstd(enc)    => enc.flush(),
            CodecWriter::Lz4(enc)     => enc.flush(),
            CodecWriter::Brotli(enc)  => enc.flush(),
            CodecWriter::Lzma { .. }  => Ok(()),
        }
    }
}

// ── Streaming decoder ────────────────────────────────────────────────────────

/// Wrap `inner` in the decompressor for `codec`.  Nothing is read from
/// `inner` until the returned reader is read.
pub fn decoder<'a, R: Read + 'a>(codec: CodecId, inner: R) -> Result<Box<dyn Read + 'a>, CodecError> {
    Ok(match codec {
        CodecId::None   => Box::new(inner),
        CodecId::Zstd   => Box::new(
            zstd::stream::read::Decoder::new(inner)
                .map_err(|e| CodecError::Decompression(e.to_string()))?,
        ),
        CodecId::Lz4    => Box::new(lz4_flex::frame::FrameDecoder::new(inner)),
        CodecId::Brotli => Box::new(brotli::Decompressor::new(inner, BROTLI_BUFFER)),
        CodecId::Lzma   => Box::new(LzmaReader { inner, out: None, failed: false }),
    })
}

/// Decodes the whole LZMA stream on the first `read`.  A failure sticks.
struct LzmaReader<R: Read> {
    inner:  R,
    out:    Option<Cursor<Vec<u8>>>,
    failed: bool,
}

impl<R: Read> LzmaReader<R> {
    fn decode(&mut self) -> io::Result<Vec<u8>> {
        let mut packed = Vec::new();
        self.inner.read_to_end(&mut packed)?;
        let mut out = Vec::new();
        lzma_rs::lzma_decompress(&mut Cursor::new(&packed[..]), &mut out)
            .map_err(|e| ArchiveError::from(CodecError::Decompression(e.to_string())))?;
        Ok(out)
    }
}

impl<R: Read> Read for LzmaReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.failed {
            return Err(ArchiveError::format("LZMA stream already failed to decode").into());
        }
        if self.out.is_none() {
            match self.decode() {
                Ok(decoded) => self.out = Some(Cursor::new(decoded)),
                Err(e) => {
                    self.failed = true;
                    return Err(e);
                }
            }
        }
        match &mut self.out {
            Some(out) => out.read(buf),
            None      => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CodecId; 5] = [CodecId::None, CodecId::Zstd, CodecId::Lz4, CodecId::Brotli, CodecId::Lzma];

    #[test]
    fn every_codec_streams_back_to_the_input() {
        let data: Vec<u8> = b"the quick brown fox ".iter().cycle().take(50_000).copied().collect();
        for codec in ALL {
            let mut enc = CodecWriter::new(codec, 3, Vec::new()).unwrap();
            for chunk in data.chunks(777) {
                enc.write_all(chunk).unwrap();
            }
            let packed = enc.finish().unwrap();
            let mut out = Vec::new();
            decoder(codec, &packed[..]).unwrap().read_to_end(&mut out).unwrap();
            assert_eq!(out, data, "codec {}", codec.name());
        }
    }

    #[test]
    fn uuid_identity_is_stable() {
        for codec in ALL {
            assert_eq!(CodecId::from_uuid(&codec.uuid()), Some(codec));
            assert_eq!(CodecId::from_def(&codec.uuid()).unwrap(), codec);
        }
        assert_eq!(uuid_to_string(&UUID_ZSTD), "b28a9d4f-5e3c-4a1b-8f2e-7c6d9b0e1a2f");
    }

    #[test]
    fn lzma_decoder_reports_damage_on_read() {
        let mut enc = CodecWriter::new(CodecId::Lzma, 3, Vec::new()).unwrap();
        enc.write_all(&[7u8; 4096]).unwrap();
        let mut packed = enc.finish().unwrap();
        packed.truncate(packed.len() / 2);

        let mut r = decoder(CodecId::Lzma, &packed[..]).unwrap();
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).unwrap_err();
        assert_eq!(ArchiveError::from_io(err, "decoding").kind(), crate::ErrorKind::Format);
        assert!(r.read(&mut [0u8; 4]).is_err());
    }

    #[test]
    fn unknown_uuid_is_rejected() {
        assert!(matches!(
            CodecId::from_def(&[0xEE; 16]),
            Err(CodecError::UnavailableCodec { .. })
        ));
        assert!(CodecId::from_def(&[1, 2, 3]).is_err());
    }
}
