//! Cipher stages over the segmented AEAD transform.

use std::io::{self, Read, Write};

use super::{ChainOutput, StageRead, StageWrite};
use crate::crypto::{Algorithm, Transform};
use crate::error::{closed_stream, Error, IoContext, Result};
use crate::stage::{StageDescriptor, StageKind};

const READ_CHUNK:  usize = 16 * 1024;
/// Most plaintext taken by one `write`; bounds the ciphertext staged in memory.
const WRITE_CHUNK: usize = 64 * 1024;

// ── Writer ───────────────────────────────────────────────────────────────────

/// Encrypts everything written to it.  Ciphertext is forwarded as whole
/// segments become available, so a single `write` may emit nothing; a large
/// `write` is accepted only partially.
pub struct EncryptingWriter<W: StageWrite> {
    inner:     W,
    alg:       Algorithm,
    iv:        Vec<u8>,
    transform: Transform,
    pending:   Vec<u8>,
    closed:    bool,
}

impl<W: StageWrite> EncryptingWriter<W> {
    pub fn new(inner: W, alg: Algorithm, iv: Vec<u8>, transform: Transform) -> Self {
        Self {
            inner,
            alg,
            iv,
            transform,
            pending: Vec::new(),
            closed:  false,
        }
    }

    /// The IV this stage was started with; persisted in its descriptor.
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }
}

impl<W: StageWrite> Write for EncryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed_stream());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let take = buf.len().min(WRITE_CHUNK);
        self.pending.clear();
        self.transform
            .update(&buf[..take], &mut self.pending)
            .map_err(|e| io::Error::from(Error::from(e)))?;
        self.inner.write_all(&self.pending)?;
        Ok(take)
    }

    // Buffered plaintext stays buffered: sealing it early would end a segment.
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: StageWrite> StageWrite for EncryptingWriter<W> {
    fn finish(&mut self) -> Result<ChainOutput> {
        if self.closed {
            return Err(Error::logic("stream already closed"));
        }
        self.closed = true;
        self.pending.clear();
        self.transform.finish(&mut self.pending)?;
        self.inner
            .write_all(&self.pending)
            .context("writing final cipher segment")?;

        let mut out = self.inner.finish()?;
        out.stages.insert(0, StageDescriptor {
            kind:  StageKind::Cipher,
            def:   self.alg.to_def(),
            iv:    self.iv.clone(),
            value: Vec::new(),
            count: None,
        });
        Ok(out)
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Decrypts the stream below it.  A segment that fails to authenticate
/// poisons the reader: every later read and the final close report it.
pub struct DecryptingReader<R: StageRead> {
    inner:     R,
    transform: Transform,
    out:       Vec<u8>,
    pos:       usize,
    eof:       bool,
    failed:    Option<String>,
    closed:    bool,
}

impl<R: StageRead> DecryptingReader<R> {
    pub fn new(inner: R, transform: Transform) -> Self {
        Self {
            inner,
            transform,
            out:    Vec::new(),
            pos:    0,
            eof:    false,
            failed: None,
            closed: false,
        }
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.inner.read(&mut chunk).context("reading ciphertext")?;
        self.out.clear();
        self.pos = 0;
        if n == 0 {
            self.eof = true;
            self.transform.finish(&mut self.out)?;
        } else {
            self.transform.update(&chunk[..n], &mut self.out)?;
        }
        Ok(())
    }
}

impl<R: StageRead> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed_stream());
        }
        if let Some(msg) = &self.failed {
            return Err(Error::integrity(msg.clone()).into());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.out.len() {
                let n = buf.len().min(self.out.len() - self.pos);
                buf[..n].copy_from_slice(&self.out[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }
            if let Err(e) = self.fill() {
                if e.kind() == crate::ErrorKind::Integrity {
                    self.failed = Some(e.to_string());
                }
                return Err(e.into());
            }
        }
    }
}

impl<R: StageRead> StageRead for DecryptingReader<R> {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::logic("stream already closed"));
        }
        self.closed = true;
        self.out.clear();
        self.inner.close()?;
        match self.failed.take() {
            Some(msg) => Err(Error::integrity(msg)),
            None      => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoProvider, Keyset, StdCrypto, TAG_LEN};
    use crate::stream::testing::{VecSink, VecSource};
    use crate::ErrorKind;

    const ALG: Algorithm = Algorithm::Aes256GcmStream { segment_size: 32 };

    fn keyset() -> Keyset {
        Keyset::from_parts([4u8; 32], [5u8; 32])
    }

    fn encrypt(data: &[u8]) -> (Vec<u8>, StageDescriptor) {
        let iv = StdCrypto.generate_iv(&ALG);
        let t = StdCrypto.encryptor(&ALG, &keyset(), &iv).unwrap();
        let mut w = EncryptingWriter::new(VecSink(Vec::new()), ALG, iv.clone(), t);
        assert_eq!(w.iv(), &iv[..]);
        assert_eq!(w.write(&[]).unwrap(), 0);
        for chunk in data.chunks(5) {
            w.write_all(chunk).unwrap();
        }
        let out = w.finish().unwrap();
        assert!(w.write(b"late").is_err());
        (w.inner.0, out.stages.into_iter().next().unwrap())
    }

    fn decrypt(bytes: Vec<u8>, desc: &StageDescriptor) -> DecryptingReader<VecSource> {
        let t = StdCrypto.decryptor(&ALG, &keyset(), &desc.iv).unwrap();
        DecryptingReader::new(VecSource::new(bytes), t)
    }

    #[test]
    fn ciphertext_reads_back() {
        let data: Vec<u8> = (0..200u8).collect();
        let (bytes, desc) = encrypt(&data);
        assert_eq!(desc.kind, StageKind::Cipher);
        assert_eq!(bytes.len(), 200 + 7 * TAG_LEN);

        let mut r = decrypt(bytes, &desc);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        r.close().unwrap();
    }

    #[test]
    fn flipped_ciphertext_is_latched() {
        let (mut bytes, desc) = encrypt(b"the quick brown fox jumps over the lazy dog");
        bytes[10] ^= 0x40;
        let mut r = decrypt(bytes, &desc);
        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).unwrap_err();
        assert_eq!(Error::from_io(err, "reading").kind(), ErrorKind::Integrity);
        assert!(r.read(&mut [0u8; 8]).is_err());
        assert_eq!(r.close().unwrap_err().kind(), ErrorKind::Integrity);
    }

    #[test]
    fn large_writes_are_taken_in_bounded_pieces() {
        let data = vec![0x5au8; 3 * WRITE_CHUNK + 100];
        let iv = StdCrypto.generate_iv(&ALG);
        let t = StdCrypto.encryptor(&ALG, &keyset(), &iv).unwrap();
        let mut w = EncryptingWriter::new(VecSink(Vec::new()), ALG, iv, t);

        assert_eq!(w.write(&data).unwrap(), WRITE_CHUNK);
        assert!(w.pending.capacity() < 2 * WRITE_CHUNK);
        w.write_all(&data[WRITE_CHUNK..]).unwrap();
        let desc = w.finish().unwrap().stages.remove(0);

        let mut r = decrypt(std::mem::take(&mut w.inner.0), &desc);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
        r.close().unwrap();
    }

    #[test]
    fn double_finish_is_a_logic_error() {
        let iv = StdCrypto.generate_iv(&ALG);
        let t = StdCrypto.encryptor(&ALG, &keyset(), &iv).unwrap();
        let mut w = EncryptingWriter::new(VecSink(Vec::new()), ALG, iv, t);
        w.finish().unwrap();
        assert_eq!(w.finish().unwrap_err().kind(), ErrorKind::Logic);
    }
}
