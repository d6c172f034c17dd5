//! Byte-stream adapters for chunked transfers.
//!
//! A [`BytePipe`] turns pluggable pull/push strategies into a `std::io`
//! reader or writer that moves exactly one block per call. [`BlockWriter`]
//! and [`BlockReader`] sit on top of a pipe and cut an arbitrary byte stream
//! into blocks of a fixed size, so a serializer can write straight into the
//! network without knowing the total length up front.
//!
//! The block protocol has a single termination rule: the last block is the
//! first one shorter than the block size. A stream whose length is an exact
//! multiple of the block size ends without an extra block (the reader relies
//! on the value decoder to stop pulling), and an empty stream is one empty
//! block.

use std::fmt;
use std::io::{self, Read, Write};

use crate::error::{Error, Result};

type Pull<'a> = Box<dyn FnMut(&mut [u8]) -> Result<usize> + 'a>;
type Push<'a> = Box<dyn FnMut(&[u8]) -> Result<()> + 'a>;
type Flush<'a> = Box<dyn FnMut() -> Result<()> + 'a>;

/// A block-at-a-time byte stream with pluggable strategies.
///
/// Reads must ask for exactly `block_size` bytes and writes may carry at most
/// `block_size` bytes; anything else fails with
/// [`io::ErrorKind::InvalidInput`]. Each call maps onto exactly one call of
/// the strategy. Seeking is not supported.
///
/// Errors raised by a strategy surface through `std::io` and are recovered
/// unchanged with [`Error::from`].
pub struct BytePipe<'a> {
    block_size: usize,
    pull: Option<Pull<'a>>,
    push: Option<Push<'a>>,
    flush: Option<Flush<'a>>,
}

impl<'a> BytePipe<'a> {
    /// A readable pipe. `pull` fills the buffer it is given and returns how
    /// many bytes it wrote.
    pub fn reader(
        block_size: usize,
        pull: impl FnMut(&mut [u8]) -> Result<usize> + 'a,
    ) -> Self {
        BytePipe {
            block_size,
            pull: Some(Box::new(pull)),
            push: None,
            flush: None,
        }
    }

    /// A writable pipe. `push` consumes one block.
    pub fn writer(block_size: usize, push: impl FnMut(&[u8]) -> Result<()> + 'a) -> Self {
        BytePipe {
            block_size,
            pull: None,
            push: Some(Box::new(push)),
            flush: None,
        }
    }

    /// Install a strategy for `flush`. Without one, flushing does nothing.
    pub fn with_flush(mut self, flush: impl FnMut() -> Result<()> + 'a) -> Self {
        self.flush = Some(Box::new(flush));
        self
    }

    /// The block size this pipe moves.
    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

impl fmt::Debug for BytePipe<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytePipe")
            .field("block_size", &self.block_size)
            .field("readable", &self.pull.is_some())
            .field("writable", &self.push.is_some())
            .finish()
    }
}

impl Read for BytePipe<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.len() != self.block_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "partial-block read of {} bytes from a {}-byte pipe",
                    buf.len(),
                    self.block_size
                ),
            ));
        }
        let pull = self.pull.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "pipe is not readable")
        })?;
        pull(buf).map_err(Error::into_io)
    }
}

impl Write for BytePipe<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() > self.block_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "write of {} bytes exceeds the {}-byte block size",
                    buf.len(),
                    self.block_size
                ),
            ));
        }
        let push = self.push.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Unsupported, "pipe is not writable")
        })?;
        push(buf).map_err(Error::into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.flush.as_mut() {
            Some(flush) => flush().map_err(Error::into_io),
            None => Ok(()),
        }
    }
}

/// What a finished block stream moved.
#[derive(Debug)]
pub struct BlockSummary {
    /// Blocks pushed or pulled, including a final short block.
    pub blocks: usize,
    /// Payload bytes in those blocks.
    pub bytes: usize,
    /// The block buffer, handed back for reuse.
    pub buffer: Vec<u8>,
}

/// Cuts a byte stream into blocks of `block_size` bytes.
///
/// Full blocks go out as soon as they fill. [`BlockWriter::finish`] writes
/// the trailing partial block, or one empty block if nothing was written at
/// all. `flush` does not emit a partial block, since a short block would end
/// the stream.
pub struct BlockWriter<W: Write> {
    inner: W,
    block: Vec<u8>,
    block_size: usize,
    blocks: usize,
    bytes: usize,
}

impl<W: Write> BlockWriter<W> {
    /// Create a writer with a fresh block buffer.
    pub fn new(inner: W, block_size: usize) -> Self {
        BlockWriter::with_buffer(inner, block_size, Vec::new())
    }

    /// Create a writer reusing `buffer` for its blocks.
    pub fn with_buffer(inner: W, block_size: usize, mut buffer: Vec<u8>) -> Self {
        buffer.clear();
        buffer.reserve(block_size);
        BlockWriter {
            inner,
            block: buffer,
            block_size,
            blocks: 0,
            bytes: 0,
        }
    }

    fn push_block(&mut self) -> io::Result<()> {
        // Not write_all: an empty final block must still reach the pipe
        let written = self.inner.write(&self.block)?;
        if written != self.block.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("pipe took {written} of {} block bytes", self.block.len()),
            ));
        }
        self.blocks += 1;
        self.bytes += written;
        self.block.clear();
        Ok(())
    }

    /// Write the final block and flush the pipe.
    pub fn finish(mut self) -> io::Result<BlockSummary> {
        if !self.block.is_empty() || self.blocks == 0 {
            self.push_block()?;
        }
        self.inner.flush()?;
        Ok(BlockSummary {
            blocks: self.blocks,
            bytes: self.bytes,
            buffer: self.block,
        })
    }
}

impl<W: Write> Write for BlockWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = self.block_size - self.block.len();
        let taken = room.min(data.len());
        self.block.extend_from_slice(&data[..taken]);
        if self.block.len() == self.block_size {
            self.push_block()?;
        }
        Ok(taken)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reassembles a byte stream from blocks of `block_size` bytes.
///
/// Each refill asks the pipe for a whole block. The first short block marks
/// the end of the stream. [`BlockReader::finish`] checks that the consumer
/// read everything that arrived.
pub struct BlockReader<R: Read> {
    inner: R,
    block: Vec<u8>,
    position: usize,
    filled: usize,
    blocks: usize,
    bytes: usize,
    exhausted: bool,
}

impl<R: Read> BlockReader<R> {
    /// Create a reader with a fresh block buffer.
    pub fn new(inner: R, block_size: usize) -> Self {
        BlockReader::with_buffer(inner, block_size, Vec::new())
    }

    /// Create a reader reusing `buffer` for its blocks.
    pub fn with_buffer(inner: R, block_size: usize, mut buffer: Vec<u8>) -> Self {
        buffer.resize(block_size, 0);
        BlockReader {
            inner,
            block: buffer,
            position: 0,
            filled: 0,
            blocks: 0,
            bytes: 0,
            exhausted: false,
        }
    }

    fn refill(&mut self) -> io::Result<()> {
        let filled = self.inner.read(&mut self.block)?;
        self.blocks += 1;
        self.bytes += filled;
        self.position = 0;
        self.filled = filled;
        if filled < self.block.len() {
            self.exhausted = true;
        }
        Ok(())
    }

    /// End the stream, collecting the empty block of an empty stream.
    ///
    /// Fails with [`io::ErrorKind::InvalidData`] if received bytes were left
    /// unread.
    pub fn finish(mut self) -> io::Result<BlockSummary> {
        if self.blocks == 0 {
            self.refill()?;
        }
        let unread = self.filled - self.position;
        if unread > 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{unread} received bytes left unread"),
            ));
        }
        Ok(BlockSummary {
            blocks: self.blocks,
            bytes: self.bytes,
            buffer: self.block,
        })
    }
}

impl<R: Read> Read for BlockReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.position == self.filled {
            if self.exhausted {
                return Ok(0);
            }
            self.refill()?;
        }
        let available = &self.block[self.position..self.filled];
        let taken = available.len().min(out.len());
        out[..taken].copy_from_slice(&available[..taken]);
        self.position += taken;
        Ok(taken)
    }
}
