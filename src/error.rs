//! Crate-wide error type.
//!
//! Every public operation returns [`Result`].  Callers branch on
//! [`Error::kind`] rather than matching message text:
//!
//! | Kind | Raised when |
//! |------|-------------|
//! | `Format` | a directory blob, property token or container header is malformed |
//! | `Authentication` | the supplied verifier does not match the archive marker |
//! | `Integrity` | a digest/MAC/AEAD/CRC check fails, or the decrypted directory is inconsistent |
//! | `Logic` | API misuse: duplicate names, double open, use after close |
//! | `NotFound` | an entry name or storage slot does not exist |
//! | `Io` | the underlying transport failed |

use std::io;
use thiserror::Error;

use crate::codec::CodecError;
use crate::container::ContainerError;
use crate::crypto::CryptoError;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Format,
    Authentication,
    Integrity,
    Logic,
    NotFound,
    Io,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Format error: {0}")]
    Format(String),
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("Integrity check failed: {0}")]
    Integrity(String),
    #[error("Invalid operation: {0}")]
    Logic(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source:  io::Error,
    },
}

impl Error {
    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Self::Logic(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// An equivalent error for reporting the same failure again.  An I/O
    /// source keeps its kind and message.
    pub(crate) fn replay(&self) -> Self {
        match self {
            Error::Format(msg)         => Error::Format(msg.clone()),
            Error::Authentication(msg) => Error::Authentication(msg.clone()),
            Error::Integrity(msg)      => Error::Integrity(msg.clone()),
            Error::Logic(msg)          => Error::Logic(msg.clone()),
            Error::NotFound(msg)       => Error::NotFound(msg.clone()),
            Error::Io { context, source } => Error::Io {
                context: context.clone(),
                source:  io::Error::new(source.kind(), source.to_string()),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Format(_)         => ErrorKind::Format,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Integrity(_)      => ErrorKind::Integrity,
            Error::Logic(_)          => ErrorKind::Logic,
            Error::NotFound(_)       => ErrorKind::NotFound,
            Error::Io { .. }         => ErrorKind::Io,
        }
    }

    /// Recover a crate error that travelled through an `io::Error`
    /// (as produced by the `Read`/`Write` impls of the stream wrappers).
    pub fn from_io(err: io::Error, context: &str) -> Self {
        if err.get_ref().map_or(false, |inner| inner.is::<Error>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(e) = inner.downcast::<Error>() {
                    return *e;
                }
            }
            return Error::integrity("stream failure lost its cause");
        }
        Error::Io { context: context.to_owned(), source: err }
    }
}

/// Attach a context string to an `io::Result`.
pub(crate) trait IoContext<T> {
    fn context(self, context: &str) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|e| Error::from_io(e, context))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io { source, .. } => source,
            Error::NotFound(_)       => io::Error::new(io::ErrorKind::NotFound, err),
            other                    => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(source) => Error::from_io(source, "running codec"),
            CodecError::UnavailableCodec { .. } => Error::Format(err.to_string()),
            other => Error::Format(other.to_string()),
        }
    }
}

impl From<CryptoError> for Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::DecryptionFailed | CryptoError::TooShort => Error::Integrity(err.to_string()),
            CryptoError::KeyDerivation(_)
            | CryptoError::EncryptionFailed
            | CryptoError::Finished => Error::Logic(err.to_string()),
            CryptoError::UnknownAlgorithm(_) | CryptoError::MalformedVerifier(_) => Error::Format(err.to_string()),
        }
    }
}

impl From<ContainerError> for Error {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::Io(source)         => Error::from_io(source, "accessing container"),
            ContainerError::Codec(inner)       => inner.into(),
            ContainerError::PayloadChecksum(_) => Error::Integrity(err.to_string()),
            ContainerError::Finished           => Error::Logic(err.to_string()),
            other                              => Error::Format(other.to_string()),
        }
    }
}

pub(crate) fn closed_stream() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "stream is closed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_error_survives_io_roundtrip() {
        let io_err: io::Error = Error::integrity("segment 3").into();
        let back = Error::from_io(io_err, "reading");
        assert_eq!(back.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn plain_io_error_gets_context() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        match Error::from_io(io_err, "reading record") {
            Error::Io { context, source } => {
                assert_eq!(context, "reading record");
                assert_eq!(source.kind(), io::ErrorKind::UnexpectedEof);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
