//! Compression stage.  Its descriptor's definition bytes are the codec UUID.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;

use super::{ChainOutput, StageRead, StageWrite};
use crate::codec::{decoder, CodecId, CodecWriter};
use crate::error::{closed_stream, Error, Result};
use crate::stage::{StageDescriptor, StageKind};

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct CompressWriter<W: StageWrite> {
    enc:   Option<CodecWriter<W>>,
    codec: CodecId,
}

impl<W: StageWrite> CompressWriter<W> {
    pub fn new(inner: W, codec: CodecId, level: i32) -> Result<Self> {
        Ok(Self {
            enc: Some(CodecWriter::new(codec, level, inner)?),
            codec,
        })
    }
}

impl<W: StageWrite> Write for CompressWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.enc.as_mut().ok_or_else(closed_stream)?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.enc.as_mut() {
            Some(enc) => enc.flush(),
            None      => Ok(()),
        }
    }
}

impl<W: StageWrite> StageWrite for CompressWriter<W> {
    fn finish(&mut self) -> Result<ChainOutput> {
        let enc = self.enc.take().ok_or_else(|| Error::logic("stream already closed"))?;
        let mut inner = enc.finish()?;
        let mut out = inner.finish()?;
        out.stages.insert(0, StageDescriptor {
            kind:  StageKind::Compress,
            def:   self.codec.uuid().to_vec(),
            iv:    Vec::new(),
            value: Vec::new(),
            count: None,
        });
        Ok(out)
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Lets the decoder own a reader that the stage still needs to close.
struct Shared<R>(Rc<RefCell<R>>);

impl<R: Read> Read for Shared<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.borrow_mut().read(buf)
    }
}

pub struct CompressReader<R: StageRead + 'static> {
    decoder: Box<dyn Read>,
    inner:   Rc<RefCell<R>>,
    drained: bool,
    closed:  bool,
}

impl<R: StageRead + 'static> CompressReader<R> {
    pub fn new(inner: R, codec: CodecId) -> Result<Self> {
        let inner = Rc::new(RefCell::new(inner));
        Ok(Self {
            decoder: decoder(codec, Shared(Rc::clone(&inner)))?,
            inner,
            drained: false,
            closed:  false,
        })
    }

    // Some decoders stop at the end of their frame.  Read the stage below
    // to its end so its own checks run, and refuse trailing garbage.
    fn drain_inner(&mut self) -> io::Result<()> {
        self.drained = true;
        let mut scratch = [0u8; 512];
        match self.inner.borrow_mut().read(&mut scratch)? {
            0 => Ok(()),
            _ => Err(Error::integrity("trailing bytes after compressed stream").into()),
        }
    }
}

impl<R: StageRead + 'static> Read for CompressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed_stream());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let n = self.decoder.read(buf)?;
        if n == 0 && !self.drained {
            self.drain_inner()?;
        }
        Ok(n)
    }
}

impl<R: StageRead + 'static> StageRead for CompressReader<R> {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::logic("stream already closed"));
        }
        self.closed = true;
        self.inner.borrow_mut().close()
    }
}
