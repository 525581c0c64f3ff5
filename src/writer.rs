//! Write controller: [`ArchiveWriter`] and its per-entry [`EntryWriter`].
//!
//! ```no_run
//! use std::io::Write;
//! use sealpack::{Argon2Provider, ArchiveOptions, ArchiveWriter, KeysetProvider};
//!
//! let hash = Argon2Provider::default().hash("secret")?;
//! let mut ar = ArchiveWriter::create("out.seal", &hash, ArchiveOptions::default())?;
//! let mut entry = ar.open_entry("readme.txt")?;
//! entry.write_all(b"Hello, world!")?;
//! entry.close()?;
//! ar.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Encrypted layout
//! Entries are stored under anonymous slot names (`00000000`, `00000001`,
//! ...) and never compressed by the container; each passes through the
//! stage chain built from [`ArchiveOptions`].  On close the directory is
//! sealed into the next slot:
//!
//! ```text
//! record extra = "SVRF" | caller verifier
//! record body  = key_salt (32) | iv (12) | AEAD segments of the directory text
//! ```

use std::fs::File;
use std::io::{self, Seek, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec::CodecId;
use crate::container::ContainerWriter;
use crate::crypto::{
    Algorithm, Argon2Provider, CryptoProvider, Keyset, KeysetProvider, PasswordHash, StdCrypto,
};
use crate::directory::{ArchiveDirectory, StandardEntry};
use crate::error::{closed_stream, Error, IoContext, Result};
use crate::options::ArchiveOptions;
use crate::props::{PropValue, PropertyBag};
use crate::stage::build_writer;
use crate::stream::{EncryptingWriter, StageWrite};
use crate::superblock::SB_FLAG_ENCRYPTED;

/// Leading bytes of the extra blob on the directory record.
pub const HEADER_MARKER: &[u8; 4] = b"SVRF";
/// Segment size of the sealed directory blob.  Fixed so a reader can open
/// it before knowing any archive options.
pub const HEADER_SEGMENT_SIZE: u32 = 64 * 1024;

/// Storage name of anonymous slot `n`.
pub fn slot_name(n: u32) -> String {
    format!("{n:08x}")
}

struct Session {
    /// Verifier of the credential the caller supplied; becomes the marker.
    caller_verifier: Vec<u8>,
    /// Fresh sibling credential this archive's keys derive from.
    hash:            PasswordHash,
    keyset:          Keyset,
}

pub struct ArchiveWriter<W: Write + Seek> {
    container:  ContainerWriter<W>,
    directory:  ArchiveDirectory,
    options:    ArchiveOptions,
    session:    Option<Session>,
    crypto:     Arc<dyn CryptoProvider>,
    next_slot:  u32,
    entry_open: bool,
    closed:     bool,
    /// First error from `close`; the file is incomplete once this is set.
    failed:     Option<Error>,
}

impl ArchiveWriter<File> {
    /// Create an encrypted archive at `path`.
    pub fn create<P: AsRef<Path>>(path: P, hash: &PasswordHash, options: ArchiveOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).context(&format!("creating {}", path.display()))?;
        Self::new(file, hash, options)
    }

    /// Create an unencrypted archive at `path`.
    pub fn create_plain<P: AsRef<Path>>(path: P, options: ArchiveOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).context(&format!("creating {}", path.display()))?;
        Self::new_plain(file, options)
    }
}

impl<W: Write + Seek> ArchiveWriter<W> {
    // ── Constructors ─────────────────────────────────────────────────────────

    pub fn new(inner: W, hash: &PasswordHash, options: ArchiveOptions) -> Result<Self> {
        Self::with_providers(inner, hash, options, &Argon2Provider::default(), Arc::new(StdCrypto))
    }

    /// Encrypted archive with explicit collaborators.  The archive's keys
    /// come from a fresh sibling of `hash`, never from `hash` itself.
    pub fn with_providers(
        inner:   W,
        hash:    &PasswordHash,
        options: ArchiveOptions,
        keys:    &dyn KeysetProvider,
        crypto:  Arc<dyn CryptoProvider>,
    ) -> Result<Self> {
        let session_hash = keys.similar(hash)?;
        let session = Session {
            caller_verifier: hash.verifier_bytes(),
            keyset:          session_hash.keyset(),
            hash:            session_hash,
        };
        Self::build(inner, options, Some(session), crypto)
    }

    pub fn new_plain(inner: W, options: ArchiveOptions) -> Result<Self> {
        Self::build(inner, options, None, Arc::new(StdCrypto))
    }

    fn build(
        inner:   W,
        options: ArchiveOptions,
        session: Option<Session>,
        crypto:  Arc<dyn CryptoProvider>,
    ) -> Result<Self> {
        options.validate()?;
        let container = ContainerWriter::new(inner)?;
        debug!(
            uuid = %container.superblock.archive_uuid,
            encrypted = session.is_some(),
            "archive writer created"
        );
        Ok(Self {
            container,
            directory:  ArchiveDirectory::new(),
            options,
            session,
            crypto,
            next_slot:  0,
            entry_open: false,
            closed:     false,
            failed:     None,
        })
    }

    // ── Entries ──────────────────────────────────────────────────────────────

    /// Start a new entry.  Only one entry may be open at a time.
    pub fn open_entry(&mut self, name: &str) -> Result<EntryWriter<'_>> {
        if self.closed {
            return Err(Error::logic("archive writer is closed"));
        }
        if self.failed.is_some() {
            return Err(Error::logic("archive writer failed to close"));
        }
        if self.entry_open {
            return Err(Error::logic("another entry is still open"));
        }
        if self.directory.contains(name) {
            return Err(Error::logic(format!("duplicate entry name '{name}'")));
        }

        let (storage, codec) = match self.session {
            Some(_) => (slot_name(self.next_slot), CodecId::None),
            None    => (name.to_owned(), self.options.compression),
        };
        let record = self.container.begin_record(&storage, &[], codec, self.options.level)?;
        if self.session.is_some() {
            self.next_slot += 1;
        }

        let base: Box<dyn StageWrite + '_> = Box::new(record);
        let chain = match &self.session {
            Some(session) => build_writer(base, &self.options, &session.keyset, self.crypto.as_ref())?,
            None          => base,
        };

        debug!(name, storage = %storage, "entry opened");
        self.entry_open = true;
        Ok(EntryWriter {
            chain:      Some(chain),
            directory:  &mut self.directory,
            entry_open: &mut self.entry_open,
            name:       name.to_owned(),
            written:    0,
            properties: PropertyBag::new(),
        })
    }

    /// Store `data` as one complete entry.
    pub fn add_entry(&mut self, name: &str, data: &[u8]) -> Result<StandardEntry> {
        let mut entry = self.open_entry(name)?;
        entry.write_all(data).context(&format!("writing entry {name}"))?;
        entry.close()
    }

    // ── Finalisation ─────────────────────────────────────────────────────────

    /// Seal the directory (encrypted archives with at least one entry) and
    /// finish the container.  A second call after success does nothing; a
    /// failure is final and every later call reports it again.
    pub fn close(&mut self) -> Result<()> {
        if let Some(err) = &self.failed {
            return Err(err.replay());
        }
        if self.closed {
            return Ok(());
        }
        if self.entry_open {
            return Err(Error::logic("cannot close archive while an entry is open"));
        }

        if let Err(err) = self.seal_and_finish() {
            warn!(error = %err, "archive close failed; file is incomplete");
            let replay = err.replay();
            self.failed = Some(err);
            return Err(replay);
        }
        self.closed = true;
        info!(
            entries = self.directory.len(),
            records = self.container.superblock.record_count,
            "archive closed"
        );
        Ok(())
    }

    fn seal_and_finish(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            if self.directory.is_empty() {
                debug!("no entries written; finishing without a header");
            } else {
                self.write_header(&session)?;
                self.container.superblock.flags |= SB_FLAG_ENCRYPTED;
            }
        }
        self.container.finish()
    }

    fn write_header(&mut self, session: &Session) -> Result<()> {
        let storage = slot_name(self.next_slot);
        self.next_slot += 1;
        self.directory.add_header(&storage).verifier = session.hash.verifier_bytes();
        let text = self.directory.encode_all();

        let mut extra = HEADER_MARKER.to_vec();
        extra.extend_from_slice(&session.caller_verifier);

        let cipher = Algorithm::Aes256GcmStream { segment_size: HEADER_SEGMENT_SIZE };
        let iv = self.crypto.generate_iv(&cipher);
        let transform = self.crypto.encryptor(&cipher, &session.keyset, &iv)?;

        let mut record = self.container.begin_record(&storage, &extra, CodecId::None, 0)?;
        record.write_all(session.hash.key_salt()).context("writing header key salt")?;
        record.write_all(&iv).context("writing header iv")?;
        let mut sealed = EncryptingWriter::new(record, cipher, iv, transform);
        sealed.write_all(text.as_bytes()).context("writing directory")?;
        let out = sealed.finish()?;

        info!(
            storage = %storage,
            entries = self.directory.len(),
            stored = out.record.stored_size,
            "directory sealed"
        );
        Ok(())
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn directory(&self) -> &ArchiveDirectory {
        &self.directory
    }

    pub fn uuid(&self) -> uuid::Uuid {
        self.container.superblock.archive_uuid
    }

    pub fn is_encrypted(&self) -> bool {
        self.session.is_some() || self.container.superblock.is_encrypted()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<W: Write + Seek> Drop for ArchiveWriter<W> {
    fn drop(&mut self) {
        if !self.closed {
            warn!(entries = self.directory.len(), "archive writer dropped without close; file is incomplete");
        }
    }
}

// ── EntryWriter ──────────────────────────────────────────────────────────────

/// Write handle for one entry.  Must be finished with [`close`](Self::close);
/// dropping it leaves the archive unusable.
pub struct EntryWriter<'a> {
    chain:      Option<Box<dyn StageWrite + 'a>>,
    directory:  &'a mut ArchiveDirectory,
    entry_open: &'a mut bool,
    name:       String,
    written:    u64,
    properties: PropertyBag,
}

impl std::fmt::Debug for EntryWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryWriter")
            .field("name", &self.name)
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

impl EntryWriter<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a user property, stored with the entry in the directory.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<PropValue>) {
        self.properties.insert(key, value);
    }

    /// Finish the stage chain and record the entry in the directory.
    pub fn close(mut self) -> Result<StandardEntry> {
        let mut chain = self.chain.take().ok_or_else(|| Error::logic("entry already closed"))?;
        let out = chain.finish()?;
        drop(chain);

        let entry = self.directory.add_entry(&self.name)?;
        entry.storage     = out.record.name;
        entry.size        = self.written;
        entry.stored_size = out.record.stored_size;
        entry.stages      = out.stages;
        entry.properties  = std::mem::take(&mut self.properties);
        *self.entry_open  = false;

        debug!(
            name = %entry.name,
            size = entry.size,
            stored = entry.stored_size,
            stages = entry.stages.len(),
            "entry closed"
        );
        Ok(entry.clone())
    }
}

impl Write for EntryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let chain = self.chain.as_mut().ok_or_else(closed_stream)?;
        let n = chain.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.chain.as_mut() {
            Some(chain) => chain.flush(),
            None        => Ok(()),
        }
    }
}

impl Drop for EntryWriter<'_> {
    fn drop(&mut self) {
        if self.chain.is_some() {
            warn!(name = %self.name, "entry writer dropped without close");
        }
    }
}
