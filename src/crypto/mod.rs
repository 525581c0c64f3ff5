//! Cryptographic collaborators: the keyset/hash provider and the
//! cipher/digest provider used by the stage chain.
//!
//! Algorithm definition bytes (stored in every crypto stage descriptor):
//! ```text
//! alg_id u8 | key_selector u8 | params...
//! ```
//! `Aes256GcmStream` carries a `u32` LE segment size as its only param.

pub mod keys;
pub mod transform;

use byteorder::{ByteOrder, LittleEndian};
use rand::RngCore;
use thiserror::Error;

pub use keys::{
    derive_master, Argon2Provider, KdfParams, Keyset, KeysetProvider, PasswordHash, Verifier,
    KEY_SALT_LEN, VERIFIER_LEN,
};
pub use transform::{Hashing, Segmenter, Transform, NONCE_LEN, TAG_LEN};

use crate::stage::StageKind;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed: wrong key or corrupted data")]
    DecryptionFailed,
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("Encrypted segment too short (minimum {TAG_LEN} bytes)")]
    TooShort,
    #[error("Unknown or malformed algorithm definition: {0}")]
    UnknownAlgorithm(String),
    #[error("Malformed verifier: {0}")]
    MalformedVerifier(String),
    #[error("Transform already finished")]
    Finished,
}

// ── Algorithm definitions ────────────────────────────────────────────────────

pub const ALG_BLAKE3:           u8 = 0x01;
pub const ALG_BLAKE3_KEYED:     u8 = 0x02;
pub const ALG_AES256_GCM_STREAM: u8 = 0x03;

/// Which keyset member drives an algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySelector {
    None   = 0,
    Cipher = 1,
    Mac    = 2,
}

impl KeySelector {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Cipher),
            2 => Some(Self::Mac),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Unkeyed BLAKE3 digest.
    Blake3,
    /// BLAKE3 in keyed mode under the MAC key.
    Blake3Keyed,
    /// Segmented AES-256-GCM under the cipher key.
    Aes256GcmStream { segment_size: u32 },
}

impl Algorithm {
    pub fn id(&self) -> u8 {
        match self {
            Algorithm::Blake3                  => ALG_BLAKE3,
            Algorithm::Blake3Keyed             => ALG_BLAKE3_KEYED,
            Algorithm::Aes256GcmStream { .. }  => ALG_AES256_GCM_STREAM,
        }
    }

    pub fn key_selector(&self) -> KeySelector {
        match self {
            Algorithm::Blake3                 => KeySelector::None,
            Algorithm::Blake3Keyed            => KeySelector::Mac,
            Algorithm::Aes256GcmStream { .. } => KeySelector::Cipher,
        }
    }

    /// The stage kind this algorithm may appear under.
    pub fn stage_kind(&self) -> StageKind {
        match self {
            Algorithm::Blake3                 => StageKind::Digest,
            Algorithm::Blake3Keyed            => StageKind::Mac,
            Algorithm::Aes256GcmStream { .. } => StageKind::Cipher,
        }
    }

    pub fn to_def(&self) -> Vec<u8> {
        let mut def = vec![self.id(), self.key_selector() as u8];
        if let Algorithm::Aes256GcmStream { segment_size } = self {
            let mut buf = [0u8; 4];
            LittleEndian::write_u32(&mut buf, *segment_size);
            def.extend_from_slice(&buf);
        }
        def
    }

    pub fn from_def(def: &[u8]) -> Result<Self, CryptoError> {
        let (&id, rest) = def
            .split_first()
            .ok_or_else(|| CryptoError::UnknownAlgorithm("empty definition".into()))?;
        let (&selector, params) = rest
            .split_first()
            .ok_or_else(|| CryptoError::UnknownAlgorithm(format!("algorithm {id:#04x} has no key selector")))?;

        let alg = match (id, params.len()) {
            (ALG_BLAKE3, 0)       => Algorithm::Blake3,
            (ALG_BLAKE3_KEYED, 0) => Algorithm::Blake3Keyed,
            (ALG_AES256_GCM_STREAM, 4) => {
                let segment_size = LittleEndian::read_u32(params);
                if segment_size == 0 {
                    return Err(CryptoError::UnknownAlgorithm("zero segment size".into()));
                }
                Algorithm::Aes256GcmStream { segment_size }
            }
            (id, n) => {
                return Err(CryptoError::UnknownAlgorithm(format!(
                    "algorithm {id:#04x} with {n} param bytes"
                )))
            }
        };
        if KeySelector::from_u8(selector) != Some(alg.key_selector()) {
            return Err(CryptoError::UnknownAlgorithm(format!(
                "key selector {selector} does not fit algorithm {id:#04x}"
            )));
        }
        Ok(alg)
    }

    /// IV length this algorithm expects (0 for digests).
    pub fn iv_len(&self) -> usize {
        match self {
            Algorithm::Aes256GcmStream { .. } => NONCE_LEN,
            _ => 0,
        }
    }
}

// ── Provider ─────────────────────────────────────────────────────────────────

/// Factory for updateable cipher and digest transforms.
pub trait CryptoProvider: Send + Sync {
    fn digest(&self, alg: &Algorithm, keyset: &Keyset) -> Result<Transform, CryptoError>;

    fn encryptor(&self, alg: &Algorithm, keyset: &Keyset, iv: &[u8]) -> Result<Transform, CryptoError>;

    fn decryptor(&self, alg: &Algorithm, keyset: &Keyset, iv: &[u8]) -> Result<Transform, CryptoError>;

    /// Fresh random IV for `alg`.
    fn generate_iv(&self, alg: &Algorithm) -> Vec<u8> {
        let mut iv = vec![0u8; alg.iv_len()];
        rand::thread_rng().fill_bytes(&mut iv);
        iv
    }
}

/// BLAKE3 + AES-256-GCM provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdCrypto;

fn selected_key<'k>(alg: &Algorithm, keyset: &'k Keyset) -> Result<&'k [u8; 32], CryptoError> {
    keyset
        .key(alg.key_selector())
        .ok_or_else(|| CryptoError::UnknownAlgorithm(format!("algorithm {:#04x} takes no key", alg.id())))
}

fn segment_params(alg: &Algorithm, iv: &[u8]) -> Result<(usize, [u8; NONCE_LEN]), CryptoError> {
    let Algorithm::Aes256GcmStream { segment_size } = alg else {
        return Err(CryptoError::UnknownAlgorithm(format!("algorithm {:#04x} is not a cipher", alg.id())));
    };
    let iv: [u8; NONCE_LEN] = iv
        .try_into()
        .map_err(|_| CryptoError::UnknownAlgorithm(format!("IV must be {NONCE_LEN} bytes, got {}", iv.len())))?;
    Ok((*segment_size as usize, iv))
}

impl CryptoProvider for StdCrypto {
    fn digest(&self, alg: &Algorithm, keyset: &Keyset) -> Result<Transform, CryptoError> {
        match alg {
            Algorithm::Blake3      => Ok(Transform::Digest(Hashing::new(None))),
            Algorithm::Blake3Keyed => Ok(Transform::Mac(Hashing::new(Some(selected_key(alg, keyset)?)))),
            other => Err(CryptoError::UnknownAlgorithm(format!("algorithm {:#04x} is not a digest", other.id()))),
        }
    }

    fn encryptor(&self, alg: &Algorithm, keyset: &Keyset, iv: &[u8]) -> Result<Transform, CryptoError> {
        let (segment, iv) = segment_params(alg, iv)?;
        Ok(Transform::Seal(Segmenter::new(selected_key(alg, keyset)?, iv, segment)))
    }

    fn decryptor(&self, alg: &Algorithm, keyset: &Keyset, iv: &[u8]) -> Result<Transform, CryptoError> {
        let (segment, iv) = segment_params(alg, iv)?;
        Ok(Transform::Open(Segmenter::new(selected_key(alg, keyset)?, iv, segment)))
    }
}
