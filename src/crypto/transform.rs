//! Updateable stage transforms.
//!
//! Every stage kind shares one contract: feed bytes with `update`, collect
//! whatever output they produce, then `finish` once to flush the tail and
//! get the stage's final value (digest/MAC output, empty for ciphers).
//!
//! Segmented AEAD layout:
//! ```text
//! [ seg 0 ciphertext | tag ][ seg 1 ciphertext | tag ] ... [ final seg | tag ]
//! ```
//! Every segment except the last holds exactly `segment` plaintext bytes; the
//! last holds 0..=segment.  Segment `i` uses nonce `iv XOR le(i)` over bytes
//! 4..12, and the last segment additionally flips bit 7 of byte 0, so a
//! stream cut at a segment boundary fails to authenticate.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use super::CryptoError;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN:   usize = 16;

const FINAL_FLAG: u8 = 0x80;

type Step = fn(&mut Segmenter, &[u8], bool, &mut Vec<u8>) -> Result<(), CryptoError>;

pub enum Transform {
    Digest(Hashing),
    Mac(Hashing),
    Seal(Segmenter),
    Open(Segmenter),
}

impl Transform {
    /// Feed `input`; output bytes (if any) are appended to `out`.
    pub fn update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        match self {
            Transform::Digest(h) | Transform::Mac(h) => h.update(input),
            Transform::Seal(s) => s.seal_update(input, out),
            Transform::Open(s) => s.open_update(input, out),
        }
    }

    /// Flush the tail into `out` and return the stage value.
    pub fn finish(&mut self, out: &mut Vec<u8>) -> Result<Vec<u8>, CryptoError> {
        match self {
            Transform::Digest(h) | Transform::Mac(h) => h.finish(),
            Transform::Seal(s) => s.seal_finish(out).map(|()| Vec::new()),
            Transform::Open(s) => s.open_finish(out).map(|()| Vec::new()),
        }
    }

    /// Bytes processed so far; only digests keep a count.
    pub fn count(&self) -> Option<u64> {
        match self {
            Transform::Digest(h) | Transform::Mac(h) => Some(h.count),
            _ => None,
        }
    }
}

// ── Digests ──────────────────────────────────────────────────────────────────

pub struct Hashing {
    hasher: blake3::Hasher,
    count:  u64,
    done:   bool,
}

impl Hashing {
    pub fn new(key: Option<&[u8; 32]>) -> Self {
        let hasher = match key {
            Some(k) => blake3::Hasher::new_keyed(k),
            None    => blake3::Hasher::new(),
        };
        Self { hasher, count: 0, done: false }
    }

    fn update(&mut self, input: &[u8]) -> Result<(), CryptoError> {
        if self.done {
            return Err(CryptoError::Finished);
        }
        self.hasher.update(input);
        self.count += input.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<Vec<u8>, CryptoError> {
        if self.done {
            return Err(CryptoError::Finished);
        }
        self.done = true;
        Ok(self.hasher.finalize().as_bytes().to_vec())
    }
}

// ── Segmented AEAD ───────────────────────────────────────────────────────────

pub struct Segmenter {
    cipher:  Aes256Gcm,
    iv:      [u8; NONCE_LEN],
    counter: u64,
    segment: usize,
    buf:     Vec<u8>,
    done:    bool,
}

impl Segmenter {
    pub fn new(key: &[u8; 32], iv: [u8; NONCE_LEN], segment: usize) -> Self {
        Self {
            cipher:  Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            iv,
            counter: 0,
            segment: segment.max(1),
            buf:     Vec::new(),
            done:    false,
        }
    }

    fn nonce(&self, last: bool) -> [u8; NONCE_LEN] {
        let mut nonce = self.iv;
        for (b, c) in nonce[4..].iter_mut().zip(self.counter.to_le_bytes()) {
            *b ^= c;
        }
        if last {
            nonce[0] ^= FINAL_FLAG;
        }
        nonce
    }

    fn seal_one(&mut self, data: &[u8], last: bool, out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let nonce = self.nonce(last);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), data)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        out.extend_from_slice(&sealed);
        self.counter += 1;
        Ok(())
    }

    fn open_one(&mut self, data: &[u8], last: bool, out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if data.len() < TAG_LEN {
            return Err(CryptoError::TooShort);
        }
        let nonce = self.nonce(last);
        let opened = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), data)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        out.extend_from_slice(&opened);
        self.counter += 1;
        Ok(())
    }

    /// Run `step` over every whole unit of `buf ++ input` except the last,
    /// which stays buffered until more input or `finish` arrives.  Units are
    /// taken straight from `input` where possible; `buf` never grows past
    /// one unit.
    fn feed(&mut self, mut input: &[u8], unit: usize, step: Step, out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if self.done {
            return Err(CryptoError::Finished);
        }
        let fill = (unit - self.buf.len()).min(input.len());
        self.buf.extend_from_slice(&input[..fill]);
        input = &input[fill..];
        if input.is_empty() {
            return Ok(());
        }

        let mut held = std::mem::take(&mut self.buf);
        let res = step(self, &held, false, out);
        held.clear();
        self.buf = held;
        res?;

        while input.len() > unit {
            let (head, rest) = input.split_at(unit);
            step(self, head, false, out)?;
            input = rest;
        }
        self.buf.extend_from_slice(input);
        Ok(())
    }

    fn seal_update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let unit = self.segment;
        self.feed(input, unit, Self::seal_one, out)
    }

    fn seal_finish(&mut self, out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if self.done {
            return Err(CryptoError::Finished);
        }
        self.done = true;
        let tail = std::mem::take(&mut self.buf);
        self.seal_one(&tail, true, out)
    }

    fn open_update(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let unit = self.segment + TAG_LEN;
        self.feed(input, unit, Self::open_one, out)
    }

    fn open_finish(&mut self, out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if self.done {
            return Err(CryptoError::Finished);
        }
        self.done = true;
        let tail = std::mem::take(&mut self.buf);
        self.open_one(&tail, true, out)
    }
}
