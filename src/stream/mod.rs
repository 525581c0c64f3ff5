//! Stage pipeline contracts and the wrappers that implement them.
//!
//! A write pipeline is a stack of [`StageWrite`]s ending in a container
//! [`RecordWriter`](crate::container::RecordWriter).  Finishing the
//! outermost stage finishes every stage below it; each stage then prepends
//! its own [`StageDescriptor`] to the list coming back up, so the result is
//! ordered outermost-first.
//!
//! A read pipeline is the mirror image: a stack of [`StageRead`]s over a
//! [`RecordBody`](crate::container::RecordBody).  Integrity failures are
//! latched and reported again by [`StageRead::close`], so a caller that
//! checks `close()` never misses one.

pub mod cipher;
pub mod compress;
pub mod digest;

use std::io::{Read, Write};

use crate::error::Result;
use crate::record::RecordHeader;
use crate::stage::StageDescriptor;

pub use cipher::{DecryptingReader, EncryptingWriter};
pub use compress::{CompressReader, CompressWriter};
pub use digest::{DigestReader, DigestWriter};

/// What a finished write pipeline leaves behind.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    /// Stage descriptors, outermost first.
    pub stages: Vec<StageDescriptor>,
    /// The patched header of the record the pipeline wrote into.
    pub record: RecordHeader,
}

pub trait StageWrite: Write {
    /// Flush this stage and everything below it.  May be called once.
    fn finish(&mut self) -> Result<ChainOutput>;
}

pub trait StageRead: Read {
    /// Release this stage and everything below it, reporting any latched
    /// integrity failure.  A second call is a logic error.
    fn close(&mut self) -> Result<()>;
}

impl<T: StageWrite + ?Sized> StageWrite for Box<T> {
    fn finish(&mut self) -> Result<ChainOutput> {
        (**self).finish()
    }
}

impl<T: StageRead + ?Sized> StageRead for Box<T> {
    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// In-memory pipeline ends for exercising single stages.
#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::io::{self, Cursor, Read, Write};
    use std::rc::Rc;

    use super::{ChainOutput, StageRead, StageWrite};
    use crate::codec::CodecId;
    use crate::error::Result;
    use crate::record::RecordHeader;

    pub(crate) struct VecSink(pub Vec<u8>);

    impl Write for VecSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl StageWrite for VecSink {
        fn finish(&mut self) -> Result<ChainOutput> {
            Ok(ChainOutput {
                stages: Vec::new(),
                record: RecordHeader::new("mem", &[], CodecId::None)?,
            })
        }
    }

    /// Sink whose bytes stay observable after it is boxed into a chain.
    pub(crate) struct SharedSink(pub Rc<RefCell<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl StageWrite for SharedSink {
        fn finish(&mut self) -> Result<ChainOutput> {
            Ok(ChainOutput {
                stages: Vec::new(),
                record: RecordHeader::new("shared", &[], CodecId::None)?,
            })
        }
    }

    pub(crate) struct VecSource(pub Cursor<Vec<u8>>);

    impl VecSource {
        pub(crate) fn new(bytes: Vec<u8>) -> Self {
            Self(Cursor::new(bytes))
        }
    }

    impl Read for VecSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl StageRead for VecSource {
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }
}
