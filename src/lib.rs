pub mod error;
pub mod props;
pub mod codec;
pub mod superblock;
pub mod record;
pub mod container;
pub mod crypto;
pub mod stage;
pub mod stream;
pub mod directory;
pub mod options;
pub mod writer;
pub mod reader;

pub use error::{Error, ErrorKind, Result};
pub use codec::CodecId;
pub use crypto::{
    Algorithm, Argon2Provider, CryptoProvider, KdfParams, Keyset, KeysetProvider, PasswordHash,
    StdCrypto, Transform, Verifier,
};
pub use directory::{ArchiveDirectory, DirectoryId, Entry, HeaderEntry, StandardEntry};
pub use options::{ArchiveOptions, Integrity};
pub use props::{PropValue, PropertyBag};
pub use reader::{ArchiveReader, EntryReader};
pub use stage::{StageDescriptor, StageKind};
pub use writer::{ArchiveWriter, EntryWriter};
