//! Read controller: [`ArchiveReader`] and its per-entry [`EntryReader`].
//!
//! ```no_run
//! use sealpack::ArchiveReader;
//!
//! let mut ar = ArchiveReader::open("out.seal")?;
//! ar.authenticate("secret")?;
//! let data = ar.read_entry("readme.txt")?;
//! assert_eq!(data, b"Hello, world!");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Opening is phase one: records are scanned up to the first one marked
//! as the sealed directory, whose body is buffered but not decrypted.
//! Until [`ArchiveReader::authenticate`] succeeds, the directory lists each
//! record under its storage name only.  Plain archives have no marked
//! record; their directory is final straight away.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec::CodecId;
use crate::container::ContainerReader;
use crate::crypto::{
    Algorithm, Argon2Provider, CryptoProvider, Keyset, KeysetProvider, PasswordHash, StdCrypto,
    Verifier, KEY_SALT_LEN, NONCE_LEN,
};
use crate::directory::{ArchiveDirectory, StandardEntry};
use crate::error::{closed_stream, Error, IoContext, Result};
use crate::stage::build_reader;
use crate::stream::{CompressReader, StageRead};
use crate::superblock::Superblock;
use crate::writer::{HEADER_MARKER, HEADER_SEGMENT_SIZE};

const SKIP_CHUNK: usize = 8 * 1024;

enum AuthState {
    /// No sealed directory: nothing to authenticate.
    Plain,
    /// Phase one done; the sealed directory body is buffered.
    Locked { marker: Vec<u8>, storage: String, blob: Vec<u8> },
    Unlocked { marker: Vec<u8>, keyset: Keyset },
}

pub struct ArchiveReader {
    path:       PathBuf,
    superblock: Superblock,
    directory:  ArchiveDirectory,
    state:      AuthState,
    keys:       Arc<dyn KeysetProvider>,
    crypto:     Arc<dyn CryptoProvider>,
}

impl std::fmt::Debug for ArchiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveReader").field("path", &self.path).finish_non_exhaustive()
    }
}

impl ArchiveReader {
    // ── Phase one ────────────────────────────────────────────────────────────

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_providers(path, Arc::new(Argon2Provider::default()), Arc::new(StdCrypto))
    }

    pub fn with_providers<P: AsRef<Path>>(
        path:   P,
        keys:   Arc<dyn KeysetProvider>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let mut container = open_container(&path)?;
        let superblock = container.superblock.clone();

        let mut directory = ArchiveDirectory::new();
        let mut state = AuthState::Plain;
        while let Some(record) = container.next_record()? {
            if let Some(verifier) = record.header.extra.strip_prefix(HEADER_MARKER.as_slice()) {
                let blob = container.read_body(&record)?;
                state = AuthState::Locked {
                    marker:  verifier.to_vec(),
                    storage: record.header.name.clone(),
                    blob,
                };
                break;
            }
            let header = &record.header;
            let entry = directory
                .add_entry(&header.name)
                .map_err(|_| Error::format(format!("record name '{}' appears twice", header.name)))?;
            entry.size        = header.orig_size;
            entry.stored_size = header.stored_size;
        }

        info!(
            path = %path.display(),
            records = directory.len(),
            encrypted = !matches!(state, AuthState::Plain),
            "archive opened"
        );
        Ok(Self { path, superblock, directory, state, keys, crypto })
    }

    // ── Phase two ────────────────────────────────────────────────────────────

    /// Authenticate with a password.  A no-op for plain archives.
    pub fn authenticate(&mut self, password: &str) -> Result<()> {
        let marker = match &self.state {
            AuthState::Plain => return Ok(()),
            AuthState::Locked { marker, .. } | AuthState::Unlocked { marker, .. } => marker,
        };
        let hash = self.keys.attempt(marker, password)?.ok_or_else(|| {
            warn!(path = %self.path.display(), "password rejected");
            Error::authentication("password does not match the archive verifier")
        })?;
        self.authenticate_hash(&hash)
    }

    /// Authenticate with an already-derived credential.  Its verifier must
    /// equal the archive's marker; nothing is decrypted otherwise.
    pub fn authenticate_hash(&mut self, hash: &PasswordHash) -> Result<()> {
        let (marker, blob, storage) = match &self.state {
            AuthState::Plain => return Ok(()),
            AuthState::Unlocked { marker, .. } => (marker, None, None),
            AuthState::Locked { marker, storage, blob } => (marker, Some(blob), Some(storage)),
        };
        let expected = Verifier::from_bytes(marker)?;
        if !hash.verifier().matches(&expected) {
            warn!(path = %self.path.display(), "credential rejected");
            return Err(Error::authentication("credential does not match the archive verifier"));
        }
        let (Some(blob), Some(storage)) = (blob, storage) else {
            debug!("already authenticated");
            return Ok(());
        };

        let (directory, keyset) = unseal_directory(
            blob,
            storage,
            hash,
            self.keys.as_ref(),
            self.crypto.as_ref(),
        )?;
        let marker = marker.clone();
        info!(entries = directory.len(), "archive authenticated");
        self.directory = directory;
        self.state = AuthState::Unlocked { marker, keyset };
        Ok(())
    }

    // ── Entry streams ────────────────────────────────────────────────────────

    /// Open a stream over one entry.  Every call reopens the archive file,
    /// so streams are independent of each other.
    pub fn get_input_stream(&self, entry: &StandardEntry) -> Result<EntryReader> {
        if !self.directory.owns(entry) {
            return Err(Error::logic(format!(
                "entry '{}' does not belong to this archive's directory",
                entry.name
            )));
        }
        let keyset = match &self.state {
            AuthState::Locked { .. } => {
                return Err(Error::logic("archive is encrypted; authenticate first"));
            }
            AuthState::Unlocked { keyset, .. } => Some(keyset),
            AuthState::Plain => None,
        };

        let mut container = open_container(&self.path)?;
        let record = container.find(&entry.storage)?.ok_or_else(|| {
            Error::not_found(format!("record '{}' for entry '{}'", entry.storage, entry.name))
        })?;
        let mut stream: Box<dyn StageRead> = Box::new(container.into_body(&record)?);
        if record.header.codec != CodecId::None {
            stream = Box::new(CompressReader::new(stream, record.header.codec)?);
        }
        if let Some(keyset) = keyset {
            stream = build_reader(&entry.stages, stream, keyset, self.crypto.as_ref())?;
        }

        debug!(name = %entry.name, storage = %entry.storage, "entry stream opened");
        Ok(EntryReader { inner: stream, name: entry.name.clone(), closed: false })
    }

    pub fn open_entry(&self, name: &str) -> Result<EntryReader> {
        let entry = self
            .directory
            .find_by_name(name)
            .ok_or_else(|| Error::not_found(format!("entry '{name}'")))?;
        self.get_input_stream(entry)
    }

    /// Read a whole entry.  Integrity is checked before the bytes are returned.
    pub fn read_entry(&self, name: &str) -> Result<Vec<u8>> {
        let mut stream = self.open_entry(name)?;
        let mut out = Vec::new();
        let read = stream.read_to_end(&mut out);
        let closed = stream.close();
        read.context(&format!("reading entry {name}"))?;
        closed?;
        Ok(out)
    }

    /// Extract every entry into `dest`, creating it if necessary.
    pub fn extract_all<P: AsRef<Path>>(&self, dest: P) -> Result<()> {
        let dest = dest.as_ref();
        fs::create_dir_all(dest).context(&format!("creating {}", dest.display()))?;
        for entry in self.directory.iter() {
            let target = dest.join(safe_relative(&entry.name)?);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).context(&format!("creating {}", parent.display()))?;
            }
            let data = self.read_entry(&entry.name)?;
            fs::write(&target, data).context(&format!("writing {}", target.display()))?;
        }
        info!(dest = %dest.display(), entries = self.directory.len(), "archive extracted");
        Ok(())
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn entries(&self) -> impl Iterator<Item = &StandardEntry> {
        self.directory.iter()
    }

    pub fn stat(&self, name: &str) -> Option<&StandardEntry> {
        self.directory.find_by_name(name)
    }

    pub fn directory(&self) -> &ArchiveDirectory {
        &self.directory
    }

    /// The verifier the archive was sealed under, if it is encrypted.
    pub fn verifier(&self) -> Option<&[u8]> {
        match &self.state {
            AuthState::Plain => None,
            AuthState::Locked { marker, .. } | AuthState::Unlocked { marker, .. } => Some(marker),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        !matches!(self.state, AuthState::Plain)
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self.state, AuthState::Locked { .. })
    }

    pub fn uuid(&self) -> uuid::Uuid {
        self.superblock.archive_uuid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_container(path: &Path) -> Result<ContainerReader<BufReader<File>>> {
    let file = File::open(path).context(&format!("opening {}", path.display()))?;
    ContainerReader::open(BufReader::new(file))
}

/// Decrypt and cross-check the sealed directory blob.
fn unseal_directory(
    blob:    &[u8],
    storage: &str,
    hash:    &PasswordHash,
    keys:    &dyn KeysetProvider,
    crypto:  &dyn CryptoProvider,
) -> Result<(ArchiveDirectory, Keyset)> {
    if blob.len() < KEY_SALT_LEN + NONCE_LEN {
        return Err(Error::integrity("sealed directory is truncated"));
    }
    let (key_salt, rest) = blob.split_at(KEY_SALT_LEN);
    let (iv, sealed) = rest.split_at(NONCE_LEN);
    let key_salt: [u8; KEY_SALT_LEN] = key_salt
        .try_into()
        .map_err(|_| Error::integrity("sealed directory key salt is malformed"))?;

    let keyset = hash.keyset_for(&key_salt);
    let cipher = Algorithm::Aes256GcmStream { segment_size: HEADER_SEGMENT_SIZE };
    let mut transform = crypto.decryptor(&cipher, &keyset, iv)?;
    let mut plain = Vec::with_capacity(sealed.len());
    transform.update(sealed, &mut plain)?;
    transform.finish(&mut plain)?;

    let text = String::from_utf8(plain).map_err(|_| Error::format("directory text is not UTF-8"))?;
    let directory = ArchiveDirectory::decode_all(&text)?;

    let header = directory
        .header()
        .ok_or_else(|| Error::integrity("sealed directory has no header entry"))?;
    if header.storage != storage {
        return Err(Error::integrity(format!(
            "directory claims slot '{}' but was read from '{storage}'",
            header.storage
        )));
    }
    let unlocked = keys
        .attempt_hash(&header.verifier, hash)?
        .ok_or_else(|| Error::integrity("directory header verifier does not match the archive marker"))?;
    if unlocked.key_salt() != &key_salt {
        return Err(Error::integrity("directory header verifier belongs to another session"));
    }
    Ok((directory, unlocked.keyset()))
}

/// Reject entry names that would escape the extraction directory.
fn safe_relative(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    let ok = !name.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    if !ok {
        return Err(Error::format(format!("entry name '{name}' is not a safe relative path")));
    }
    Ok(path.to_path_buf())
}

// ── EntryReader ──────────────────────────────────────────────────────────────

/// Stream over one entry's plaintext.  Always check [`close`](Self::close):
/// digest and MAC mismatches are only reported there.
pub struct EntryReader {
    inner:  Box<dyn StageRead>,
    name:   String,
    closed: bool,
}

impl std::fmt::Debug for EntryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryReader")
            .field("name", &self.name)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl EntryReader {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Discard up to `n` bytes.  They still pass through every stage.
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

    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::logic("stream already closed"));
        }
        self.closed = true;
        self.inner.close().map_err(|e| {
            warn!(name = %self.name, error = %e, "entry failed verification");
            e
        })
    }
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed_stream());
        }
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerWriter;
    use crate::crypto::KdfParams;
    use crate::options::ArchiveOptions;
    use crate::record::RecordHeader;
    use crate::superblock::SUPERBLOCK_SIZE;
    use crate::writer::{slot_name, ArchiveWriter};
    use crate::ErrorKind;

    fn cheap() -> Argon2Provider {
        Argon2Provider::new(KdfParams { mem_cost_kib: 256, time_cost: 1, parallelism: 1 })
    }

    /// `key_salt | iv | AEAD(directory)` under `session`'s keys.
    fn sealed_blob(session: &PasswordHash, dir: &ArchiveDirectory) -> Vec<u8> {
        let cipher = Algorithm::Aes256GcmStream { segment_size: HEADER_SEGMENT_SIZE };
        let iv = StdCrypto.generate_iv(&cipher);
        let mut t = StdCrypto.encryptor(&cipher, &session.keyset(), &iv).unwrap();
        let mut blob = session.key_salt().to_vec();
        blob.extend_from_slice(&iv);
        t.update(dir.encode_all().as_bytes(), &mut blob).unwrap();
        t.finish(&mut blob).unwrap();
        blob
    }

    fn header_only(slot: &str, verifier: Vec<u8>) -> ArchiveDirectory {
        let mut dir = ArchiveDirectory::new();
        dir.add_header(slot).verifier = verifier;
        dir
    }

    /// A one-record archive whose only record is a sealed directory in slot 0.
    fn forged_archive(path: &Path, marker: &[u8], blob: &[u8]) {
        let mut extra = HEADER_MARKER.to_vec();
        extra.extend_from_slice(marker);
        let mut c = ContainerWriter::new(File::create(path).unwrap()).unwrap();
        c.write_record(&slot_name(0), &extra, CodecId::None, 0, blob).unwrap();
        c.finish().unwrap();
    }

    fn assert_rejected(path: &Path, caller: &PasswordHash) {
        let mut reader = ArchiveReader::open(path).unwrap();
        assert!(reader.is_encrypted());
        assert_eq!(reader.authenticate_hash(caller).unwrap_err().kind(), ErrorKind::Integrity);
        assert!(!reader.is_authenticated());
        assert_eq!(reader.authenticate("pw").unwrap_err().kind(), ErrorKind::Integrity);
        assert!(!reader.is_authenticated());
    }

    #[test]
    fn consistent_sealed_directory_unlocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.seal");
        let caller = cheap().hash("pw").unwrap();
        let session = cheap().similar(&caller).unwrap();
        let blob = sealed_blob(&session, &header_only("00000000", session.verifier_bytes()));
        forged_archive(&path, &caller.verifier_bytes(), &blob);

        let mut reader = ArchiveReader::open(&path).unwrap();
        reader.authenticate("pw").unwrap();
        assert!(reader.is_authenticated());
        assert_eq!(reader.directory().header().unwrap().storage, "00000000");
    }

    #[test]
    fn header_naming_another_slot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot.seal");
        let caller = cheap().hash("pw").unwrap();
        let session = cheap().similar(&caller).unwrap();
        let blob = sealed_blob(&session, &header_only("00000001", session.verifier_bytes()));
        forged_archive(&path, &caller.verifier_bytes(), &blob);
        assert_rejected(&path, &caller);
    }

    #[test]
    fn header_verifier_from_another_password_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("password.seal");
        let caller = cheap().hash("pw").unwrap();
        let session = cheap().similar(&caller).unwrap();
        let stranger = cheap().hash("other").unwrap();
        let blob = sealed_blob(&session, &header_only("00000000", stranger.verifier_bytes()));
        forged_archive(&path, &caller.verifier_bytes(), &blob);
        assert_rejected(&path, &caller);
    }

    #[test]
    fn header_verifier_from_another_session_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.seal");
        let caller = cheap().hash("pw").unwrap();
        let session = cheap().similar(&caller).unwrap();
        let sibling = cheap().similar(&caller).unwrap();
        let blob = sealed_blob(&session, &header_only("00000000", sibling.verifier_bytes()));
        forged_archive(&path, &caller.verifier_bytes(), &blob);
        assert_rejected(&path, &caller);
    }

    #[test]
    fn sealed_directory_without_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headless.seal");
        let caller = cheap().hash("pw").unwrap();
        let session = cheap().similar(&caller).unwrap();
        let blob = sealed_blob(&session, &ArchiveDirectory::new());
        forged_archive(&path, &caller.verifier_bytes(), &blob);
        assert_rejected(&path, &caller);
    }

    #[test]
    fn marker_with_huge_kdf_cost_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kdf.seal");
        let caller = cheap().hash("pw").unwrap();
        let session = cheap().similar(&caller).unwrap();
        let blob = sealed_blob(&session, &header_only("00000000", session.verifier_bytes()));
        let mut marker = caller.verifier_bytes();
        // mem_cost_kib follows the version byte and the 16-byte salt
        marker[17..21].copy_from_slice(&u32::MAX.to_le_bytes());
        forged_archive(&path, &marker, &blob);

        let mut reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.authenticate("pw").unwrap_err().kind(), ErrorKind::Format);
        assert_eq!(reader.authenticate_hash(&caller).unwrap_err().kind(), ErrorKind::Format);
        assert!(!reader.is_authenticated());
    }

    #[test]
    fn header_record_with_forged_size_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("size.seal");
        let caller = cheap().hash("pw").unwrap();
        forged_archive(&path, &caller.verifier_bytes(), b"not really sealed");

        let mut bytes = fs::read(&path).unwrap();
        let mut header = RecordHeader::read(&bytes[SUPERBLOCK_SIZE..]).unwrap();
        header.orig_size = u64::MAX / 2;
        let mut encoded = Vec::new();
        header.write(&mut encoded).unwrap();
        bytes[SUPERBLOCK_SIZE..SUPERBLOCK_SIZE + encoded.len()].copy_from_slice(&encoded);
        fs::write(&path, bytes).unwrap();

        assert_eq!(ArchiveReader::open(&path).unwrap_err().kind(), ErrorKind::Format);
    }

    #[test]
    fn unsafe_names_are_rejected() {
        assert!(safe_relative("docs/readme.md").is_ok());
        for bad in ["", "../up", "/abs", "a/../../b", "./here"] {
            assert_eq!(safe_relative(bad).unwrap_err().kind(), ErrorKind::Format, "{bad}");
        }
    }

    #[test]
    fn truncated_header_blob_is_an_integrity_error() {
        let hash = Argon2Provider::new(KdfParams { mem_cost_kib: 256, time_cost: 1, parallelism: 1 })
            .hash("pw")
            .unwrap();
        let err = unseal_directory(&[0u8; 20], "00000000", &hash, &Argon2Provider::default(), &StdCrypto)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn locked_reader_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.seal");
        let hash = Argon2Provider::new(KdfParams { mem_cost_kib: 256, time_cost: 1, parallelism: 1 })
            .hash("pw")
            .unwrap();
        let mut w = ArchiveWriter::create(&path, &hash, ArchiveOptions::default()).unwrap();
        w.add_entry("one", b"1").unwrap();
        w.close().unwrap();

        let reader = ArchiveReader::open(&path).unwrap();
        assert!(reader.is_encrypted());
        assert!(!reader.is_authenticated());
        assert_eq!(reader.uuid(), w.uuid());
        assert_eq!(reader.path(), path.as_path());
        assert_eq!(reader.open_entry("00000000").unwrap_err().kind(), ErrorKind::Logic);
        assert!(reader.extract_all(dir.path().join("out")).is_err());
    }
}
