//! Password hashing, verifiers and keysets.
//!
//! A [`PasswordHash`] is the access credential derived from a password:
//!
//! ```text
//! master   = Argon2id(password, salt, params)            (32 B, secret)
//! keyset   = BLAKE3-derive(master ‖ key_salt)            (cipher key, MAC key)
//! check    = BLAKE3-derive(master ‖ key_salt)            (public)
//! verifier = version ‖ salt ‖ params ‖ key_salt ‖ check  (public)
//! ```
//! Two hashes with the same salt and params are "similar": they prove the
//! same password but carry different key salts, hence different keysets.

use std::fmt;
use std::io::{Cursor, Read};

use argon2::{Algorithm as Argon2Algorithm, Argon2, Params, Version};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use super::{CryptoError, KeySelector};

pub const KEY_LEN:      usize = 32;
pub const SALT_LEN:     usize = 16;
pub const KEY_SALT_LEN: usize = 32;
pub const CHECK_LEN:    usize = 32;
pub const VERIFIER_VERSION: u8 = 1;
pub const VERIFIER_LEN: usize = 1 + SALT_LEN + 12 + KEY_SALT_LEN + CHECK_LEN;

const CTX_CHECK:      &str = "sealpack 2024-06-01 verifier check";
const CTX_CIPHER_KEY: &str = "sealpack 2024-06-01 cipher key";
const CTX_MAC_KEY:    &str = "sealpack 2024-06-01 mac key";

// ── KDF parameters ───────────────────────────────────────────────────────────

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub mem_cost_kib: u32,
    pub time_cost:    u32,
    pub parallelism:  u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 64 * 1024,
            time_cost:    3,
            parallelism:  1,
        }
    }
}

/// Upper bounds on parameters accepted from a stored verifier.
pub const MAX_MEM_COST_KIB: u32 = 4 * 1024 * 1024;
pub const MAX_TIME_COST:    u32 = 64;
pub const MAX_PARALLELISM:  u32 = 64;

impl KdfParams {
    /// Reject costs outside what this crate will ever run.
    pub fn check_bounds(&self) -> Result<(), CryptoError> {
        if self.mem_cost_kib > MAX_MEM_COST_KIB
            || self.time_cost == 0
            || self.time_cost > MAX_TIME_COST
            || self.parallelism == 0
            || self.parallelism > MAX_PARALLELISM
        {
            return Err(CryptoError::MalformedVerifier(format!(
                "KDF parameters out of range (m={} KiB, t={}, p={})",
                self.mem_cost_kib, self.time_cost, self.parallelism
            )));
        }
        Ok(())
    }
}

/// Argon2id(password, salt) → 32-byte master secret.
pub fn derive_master(
    password: &[u8],
    salt:     &[u8; SALT_LEN],
    params:   &KdfParams,
) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    params.check_bounds().map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon_params = Params::new(params.mem_cost_kib, params.time_cost, params.parallelism, Some(KEY_LEN))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Argon2Algorithm::Argon2id, Version::V0x13, argon_params);
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password, salt, key.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

fn derive_with_salt(context: &str, master: &[u8; KEY_LEN], key_salt: &[u8; KEY_SALT_LEN]) -> [u8; 32] {
    let mut material = Zeroizing::new([0u8; KEY_LEN + KEY_SALT_LEN]);
    material[..KEY_LEN].copy_from_slice(master);
    material[KEY_LEN..].copy_from_slice(key_salt);
    blake3::derive_key(context, material.as_ref())
}

// ── Keyset ───────────────────────────────────────────────────────────────────

/// Symmetric key material for one archive session.  Zeroized on drop.
#[derive(Clone)]
pub struct Keyset {
    cipher: [u8; KEY_LEN],
    mac:    [u8; KEY_LEN],
}

impl Keyset {
    pub fn from_parts(cipher: [u8; KEY_LEN], mac: [u8; KEY_LEN]) -> Self {
        Self { cipher, mac }
    }

    pub fn key(&self, selector: KeySelector) -> Option<&[u8; KEY_LEN]> {
        match selector {
            KeySelector::None   => None,
            KeySelector::Cipher => Some(&self.cipher),
            KeySelector::Mac    => Some(&self.mac),
        }
    }
}

impl Drop for Keyset {
    fn drop(&mut self) {
        self.cipher.zeroize();
        self.mac.zeroize();
    }
}

impl fmt::Debug for Keyset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyset").field("keys", &"[REDACTED]").finish()
    }
}

// ── Verifier ─────────────────────────────────────────────────────────────────

/// Public proof of password knowledge.  Safe to store unencrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verifier {
    pub salt:     [u8; SALT_LEN],
    pub params:   KdfParams,
    pub key_salt: [u8; KEY_SALT_LEN],
    pub check:    [u8; CHECK_LEN],
}

impl Verifier {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(VERIFIER_LEN);
        out.push(VERIFIER_VERSION);
        out.extend_from_slice(&self.salt);
        // Writes into a Vec cannot fail.
        let _ = out.write_u32::<LittleEndian>(self.params.mem_cost_kib);
        let _ = out.write_u32::<LittleEndian>(self.params.time_cost);
        let _ = out.write_u32::<LittleEndian>(self.params.parallelism);
        out.extend_from_slice(&self.key_salt);
        out.extend_from_slice(&self.check);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != VERIFIER_LEN {
            return Err(CryptoError::MalformedVerifier(format!(
                "expected {VERIFIER_LEN} bytes, got {}", bytes.len()
            )));
        }
        let mut r = Cursor::new(bytes);
        let version = r.read_u8().map_err(|e| CryptoError::MalformedVerifier(e.to_string()))?;
        if version != VERIFIER_VERSION {
            return Err(CryptoError::MalformedVerifier(format!("unsupported version {version}")));
        }
        let malformed = |e: std::io::Error| CryptoError::MalformedVerifier(e.to_string());
        let mut salt = [0u8; SALT_LEN];
        r.read_exact(&mut salt).map_err(malformed)?;
        let params = KdfParams {
            mem_cost_kib: r.read_u32::<LittleEndian>().map_err(malformed)?,
            time_cost:    r.read_u32::<LittleEndian>().map_err(malformed)?,
            parallelism:  r.read_u32::<LittleEndian>().map_err(malformed)?,
        };
        let mut key_salt = [0u8; KEY_SALT_LEN];
        r.read_exact(&mut key_salt).map_err(malformed)?;
        let mut check = [0u8; CHECK_LEN];
        r.read_exact(&mut check).map_err(malformed)?;
        params.check_bounds()?;
        Ok(Self { salt, params, key_salt, check })
    }

    /// Same password parameters (salt and KDF cost).
    pub fn is_similar(&self, other: &Verifier) -> bool {
        self.salt == other.salt && self.params == other.params
    }

    /// Constant-time comparison of the check values plus the public fields.
    pub fn matches(&self, other: &Verifier) -> bool {
        self.is_similar(other)
            && self.key_salt == other.key_salt
            && blake3::Hash::from(self.check) == blake3::Hash::from(other.check)
    }
}

// ── PasswordHash ─────────────────────────────────────────────────────────────

/// The access credential derived from a password.
#[derive(Clone)]
pub struct PasswordHash {
    verifier: Verifier,
    master:   Zeroizing<[u8; KEY_LEN]>,
}

impl PasswordHash {
    fn from_master(
        master:   Zeroizing<[u8; KEY_LEN]>,
        salt:     [u8; SALT_LEN],
        params:   KdfParams,
        key_salt: [u8; KEY_SALT_LEN],
    ) -> Self {
        let check = derive_with_salt(CTX_CHECK, &master, &key_salt);
        Self {
            verifier: Verifier { salt, params, key_salt, check },
            master,
        }
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    pub fn verifier_bytes(&self) -> Vec<u8> {
        self.verifier.to_bytes()
    }

    pub fn key_salt(&self) -> &[u8; KEY_SALT_LEN] {
        &self.verifier.key_salt
    }

    /// The keyset bound to this hash's own key salt.
    pub fn keyset(&self) -> Keyset {
        self.keyset_for(&self.verifier.key_salt)
    }

    /// The keyset this credential derives for an arbitrary key salt.
    pub fn keyset_for(&self, key_salt: &[u8; KEY_SALT_LEN]) -> Keyset {
        Keyset::from_parts(
            derive_with_salt(CTX_CIPHER_KEY, &self.master, key_salt),
            derive_with_salt(CTX_MAC_KEY, &self.master, key_salt),
        )
    }

    /// Unlock a sibling verifier (same salt and params) without re-running
    /// the KDF.  Returns `None` when it was made from a different password.
    pub fn unlock(&self, verifier: &Verifier) -> Option<PasswordHash> {
        if !self.verifier.is_similar(verifier) {
            return None;
        }
        let candidate = Self::from_master(
            self.master.clone(),
            verifier.salt,
            verifier.params,
            verifier.key_salt,
        );
        candidate.verifier.matches(verifier).then_some(candidate)
    }

    fn with_key_salt(&self, key_salt: [u8; KEY_SALT_LEN]) -> Self {
        Self::from_master(self.master.clone(), self.verifier.salt, self.verifier.params, key_salt)
    }
}

impl fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordHash")
            .field("verifier", &self.verifier)
            .field("master", &"[REDACTED]")
            .finish()
    }
}

// ── Provider ─────────────────────────────────────────────────────────────────

/// The keyset/hash service the archive controllers depend on.
pub trait KeysetProvider: Send + Sync {
    /// Hash a password with fresh salt and key material.
    fn hash(&self, password: &str) -> Result<PasswordHash, CryptoError>;

    /// Same verification parameters, fresh random key material.
    fn similar(&self, hash: &PasswordHash) -> Result<PasswordHash, CryptoError>;

    /// Re-derive the hash behind `verifier` from a password.
    fn attempt(&self, verifier: &[u8], password: &str) -> Result<Option<PasswordHash>, CryptoError>;

    /// Unlock `verifier` with an already-derived credential.
    fn attempt_hash(&self, verifier: &[u8], hash: &PasswordHash) -> Result<Option<PasswordHash>, CryptoError> {
        let verifier = Verifier::from_bytes(verifier)?;
        Ok(hash.unlock(&verifier))
    }
}

/// Argon2id-backed [`KeysetProvider`].
#[derive(Debug, Clone, Default)]
pub struct Argon2Provider {
    params: KdfParams,
}

impl Argon2Provider {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

impl KeysetProvider for Argon2Provider {
    fn hash(&self, password: &str) -> Result<PasswordHash, CryptoError> {
        let salt: [u8; SALT_LEN] = random_bytes();
        let master = derive_master(password.as_bytes(), &salt, &self.params)?;
        Ok(PasswordHash::from_master(master, salt, self.params, random_bytes()))
    }

    fn similar(&self, hash: &PasswordHash) -> Result<PasswordHash, CryptoError> {
        Ok(hash.with_key_salt(random_bytes()))
    }

    fn attempt(&self, verifier: &[u8], password: &str) -> Result<Option<PasswordHash>, CryptoError> {
        let verifier = Verifier::from_bytes(verifier)?;
        let master = derive_master(password.as_bytes(), &verifier.salt, &verifier.params)?;
        let candidate = PasswordHash::from_master(master, verifier.salt, verifier.params, verifier.key_salt);
        Ok(candidate.verifier.matches(&verifier).then_some(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Argon2Provider {
        Argon2Provider::new(KdfParams { mem_cost_kib: 256, time_cost: 1, parallelism: 1 })
    }

    #[test]
    fn attempt_accepts_only_the_right_password() {
        let p = provider();
        let hash = p.hash("secret").unwrap();
        let bytes = hash.verifier_bytes();
        assert_eq!(bytes.len(), VERIFIER_LEN);

        let again = p.attempt(&bytes, "secret").unwrap().expect("password should unlock");
        assert_eq!(again.verifier(), hash.verifier());
        assert!(p.attempt(&bytes, "wrong").unwrap().is_none());
    }

    #[test]
    fn similar_keeps_params_but_not_keys() {
        let p = provider();
        let hash = p.hash("secret").unwrap();
        let sibling = p.similar(&hash).unwrap();

        assert!(hash.verifier().is_similar(sibling.verifier()));
        assert_ne!(hash.key_salt(), sibling.key_salt());
        assert_ne!(
            hash.keyset().key(KeySelector::Cipher),
            sibling.keyset().key(KeySelector::Cipher)
        );

        let unlocked = p.attempt_hash(&sibling.verifier_bytes(), &hash).unwrap().unwrap();
        assert_eq!(
            unlocked.keyset().key(KeySelector::Mac),
            sibling.keyset().key(KeySelector::Mac)
        );
    }

    #[test]
    fn unrelated_hash_cannot_unlock() {
        let p = provider();
        let a = p.hash("secret").unwrap();
        let b = p.hash("secret").unwrap(); // different salt
        assert!(p.attempt_hash(&b.verifier_bytes(), &a).unwrap().is_none());
    }

    #[test]
    fn malformed_verifier_is_rejected() {
        let p = provider();
        assert!(matches!(p.attempt(&[1, 2, 3], "x"), Err(CryptoError::MalformedVerifier(_))));
        let mut bytes = p.hash("x").unwrap().verifier_bytes();
        bytes[0] = 9;
        assert!(Verifier::from_bytes(&bytes).is_err());
    }

    #[test]
    fn oversized_kdf_params_are_refused_before_hashing() {
        let p = provider();
        let good = p.hash("secret").unwrap().verifier_bytes();

        // mem_cost_kib, time_cost, parallelism sit at offsets 17, 21, 25.
        for (offset, value) in [(17, u32::MAX), (21, u32::MAX), (25, u32::MAX), (21, 0)] {
            let mut bytes = good.clone();
            bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            assert!(matches!(
                p.attempt(&bytes, "secret"),
                Err(CryptoError::MalformedVerifier(_))
            ));
        }

        let huge = KdfParams { mem_cost_kib: MAX_MEM_COST_KIB + 1, ..KdfParams::default() };
        assert!(matches!(
            Argon2Provider::new(huge).hash("secret"),
            Err(CryptoError::KeyDerivation(_))
        ));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let hash = provider().hash("secret").unwrap();
        assert!(format!("{hash:?}").contains("REDACTED"));
        assert!(format!("{:?}", hash.keyset()).contains("REDACTED"));
    }
}
