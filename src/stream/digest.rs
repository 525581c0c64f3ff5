//! Digest and MAC stages.
//!
//! The writer hashes plaintext on its way down and records the value and
//! byte count.  The reader hashes what it hands out and compares both on
//! close; reading stays forward-only, so there is no mark/reset and
//! [`DigestReader::skip`] reads through the digest instead of seeking.

use std::io::{self, Read, Write};

use tracing::warn;

use super::{ChainOutput, StageRead, StageWrite};
use crate::crypto::{Algorithm, Transform};
use crate::error::{closed_stream, Error, Result};
use crate::stage::StageDescriptor;

const SKIP_CHUNK: usize = 8 * 1024;

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct DigestWriter<W: StageWrite> {
    inner:     W,
    alg:       Algorithm,
    transform: Transform,
    finished:  bool,
}

impl<W: StageWrite> DigestWriter<W> {
    pub fn new(inner: W, alg: Algorithm, transform: Transform) -> Self {
        Self { inner, alg, transform, finished: false }
    }
}

impl<W: StageWrite> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(closed_stream());
        }
        let n = self.inner.write(buf)?;
        self.transform
            .update(&buf[..n], &mut Vec::new())
            .map_err(|e| io::Error::from(Error::from(e)))?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: StageWrite> StageWrite for DigestWriter<W> {
    fn finish(&mut self) -> Result<ChainOutput> {
        if self.finished {
            return Err(Error::logic("stream already closed"));
        }
        self.finished = true;
        let value = self.transform.finish(&mut Vec::new())?;
        let count = self.transform.count();

        let mut out = self.inner.finish()?;
        out.stages.insert(0, StageDescriptor {
            kind:  self.alg.stage_kind(),
            def:   self.alg.to_def(),
            iv:    Vec::new(),
            value,
            count,
        });
        Ok(out)
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct DigestReader<R: StageRead> {
    inner:          R,
    transform:      Transform,
    expected:       Vec<u8>,
    expected_count: Option<u64>,
    eof:            bool,
    closed:         bool,
}

impl<R: StageRead> DigestReader<R> {
    pub fn new(inner: R, transform: Transform, expected: Vec<u8>, expected_count: Option<u64>) -> Self {
        Self {
            inner,
            transform,
            expected,
            expected_count,
            eof:    false,
            closed: false,
        }
    }

    /// Discard up to `n` bytes.  They still pass through the digest.
    pub fn skip(&mut self, n: u64) -> io::Result<u64> {
        let mut scratch = [0u8; SKIP_CHUNK];
        let mut skipped = 0u64;
        while skipped < n {
            let want = (n - skipped).min(SKIP_CHUNK as u64) as usize;
            let got = self.read(&mut scratch[..want])?;
            if got == 0 {
                break;
            }
            skipped += got as u64;
        }
        Ok(skipped)
    }

    fn verify(&mut self) -> Result<()> {
        let value = self.transform.finish(&mut Vec::new())?;
        if let (Some(expected), Some(actual)) = (self.expected_count, self.transform.count()) {
            if expected != actual {
                return Err(Error::integrity(format!(
                    "digest covered {actual} bytes, expected {expected}"
                )));
            }
        }
        if !digest_eq(&value, &self.expected) {
            return Err(Error::integrity("digest mismatch"));
        }
        Ok(())
    }
}

fn digest_eq(a: &[u8], b: &[u8]) -> bool {
    match (<[u8; 32]>::try_from(a), <[u8; 32]>::try_from(b)) {
        (Ok(a), Ok(b)) => blake3::Hash::from(a) == blake3::Hash::from(b),
        _ => false,
    }
}

impl<R: StageRead> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed_stream());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.eof = true;
        } else {
            self.transform
                .update(&buf[..n], &mut Vec::new())
                .map_err(|e| io::Error::from(Error::from(e)))?;
        }
        Ok(n)
    }
}

impl<R: StageRead> StageRead for DigestReader<R> {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::logic("stream already closed"));
        }
        self.closed = true;
        self.inner.close()?;
        if !self.eof {
            return Ok(());
        }
        self.verify().map_err(|e| {
            warn!(error = %e, "digest verification failed");
            e
        })
    }
}
