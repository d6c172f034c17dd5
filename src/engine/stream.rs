//! Values as sequences of length-prefixed chunks.
//!
//! Every chunk is two messages: its byte count as a fixed-layout `u64`, then
//! the bytes themselves (omitted when the count is zero). The direct tier
//! sends the whole encoding as a single chunk. The split tier streams the
//! encoder through a [`BlockWriter`] so at most one block is buffered, and the
//! receiving decoder pulls blocks until the value is complete.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec;
use crate::config::EngineConfig;
use crate::datatype::{decode_slice, encode_slice, MpiDatatype};
use crate::error::{Error, Result};
use crate::pipe::{BlockReader, BlockWriter, BytePipe};
use crate::status::Status;
use crate::transport::{ContextId, Transport};

/// Moves whole messages to or from one peer.
pub(crate) trait MessageLink {
    fn send_message(&mut self, data: Bytes) -> Result<()>;

    /// Receive one message of at most `capacity` bytes.
    fn recv_message(&mut self, capacity: usize) -> Result<Bytes>;
}

/// Tier and block size. Must agree on both ends of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Framing {
    pub(crate) split: bool,
    pub(crate) block_size: usize,
}

impl Framing {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        Framing {
            split: config.split_large_objects,
            block_size: config.buffer_size,
        }
    }
}

pub(crate) fn send_chunk<L: MessageLink + ?Sized>(link: &mut L, data: &[u8]) -> Result<()> {
    link.send_message(encode_slice(&[data.len() as u64]))?;
    if !data.is_empty() {
        link.send_message(Bytes::copy_from_slice(data))?;
    }
    Ok(())
}

/// Receive one chunk, refusing chunks longer than `limit`.
pub(crate) fn recv_chunk<L: MessageLink + ?Sized>(
    link: &mut L,
    limit: Option<usize>,
) -> Result<Bytes> {
    let prefix = link.recv_message(u64::WIRE_SIZE)?;
    let len = match decode_slice::<u64>(&prefix)?.as_slice() {
        [len] => *len as usize,
        other => {
            return Err(Error::Protocol(format!(
                "chunk length prefix holds {} values",
                other.len()
            )))
        }
    };
    if let Some(limit) = limit {
        if len > limit {
            return Err(Error::Protocol(format!(
                "chunk of {len} bytes exceeds the {limit}-byte buffer"
            )));
        }
    }
    if len == 0 {
        return Ok(Bytes::new());
    }
    let data = link.recv_message(len)?;
    if data.len() != len {
        return Err(Error::Protocol(format!(
            "chunk announced {len} bytes, received {}",
            data.len()
        )));
    }
    Ok(data)
}

/// Send `value` over `link`. Returns the encoded size in bytes.
///
/// `scratch` is the block buffer of the split tier; it is handed back for the
/// next transfer.
pub(crate) fn write_value<T, L>(
    link: &mut L,
    value: &T,
    framing: Framing,
    scratch: &mut Vec<u8>,
) -> Result<usize>
where
    T: Serialize + ?Sized,
    L: MessageLink + ?Sized,
{
    if !framing.split {
        let bytes = codec::to_bytes(value)?;
        send_chunk(link, &bytes)?;
        return Ok(bytes.len());
    }
    let pipe = BytePipe::writer(framing.block_size, |block| send_chunk(link, block));
    let mut writer = BlockWriter::with_buffer(pipe, framing.block_size, std::mem::take(scratch));
    codec::to_writer(value, &mut writer)?;
    let summary = writer.finish()?;
    tracing::trace!(blocks = summary.blocks, bytes = summary.bytes, "value streamed out");
    *scratch = summary.buffer;
    Ok(summary.bytes)
}

/// Receive a value sent with [`write_value`]. Returns it with its encoded size.
pub(crate) fn read_value<T, L>(
    link: &mut L,
    framing: Framing,
    scratch: &mut Vec<u8>,
) -> Result<(T, usize)>
where
    T: DeserializeOwned,
    L: MessageLink + ?Sized,
{
    if !framing.split {
        let data = recv_chunk(link, None)?;
        let value = codec::from_bytes(&data)?;
        return Ok((value, data.len()));
    }
    let pipe = BytePipe::reader(framing.block_size, |buf| {
        let chunk = recv_chunk(link, Some(buf.len()))?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    });
    let mut reader = BlockReader::with_buffer(pipe, framing.block_size, std::mem::take(scratch));
    let value = codec::from_reader(&mut reader)?;
    let summary = reader.finish()?;
    tracing::trace!(blocks = summary.blocks, bytes = summary.bytes, "value streamed in");
    *scratch = summary.buffer;
    Ok((value, summary.bytes))
}

/// A link that calls the transport directly with blocking operations.
pub(crate) struct DirectLink<'t> {
    transport: &'t dyn Transport,
    ctx: ContextId,
    peer: i32,
    tag: i32,
}

impl<'t> DirectLink<'t> {
    pub(crate) fn new(transport: &'t dyn Transport, ctx: ContextId, peer: i32, tag: i32) -> Self {
        DirectLink {
            transport,
            ctx,
            peer,
            tag,
        }
    }

    /// Status of a finished receive through this link.
    pub(crate) fn status(&self, bytes: usize) -> Status {
        Status::new(self.peer, self.tag, bytes as i64)
    }
}

impl MessageLink for DirectLink<'_> {
    fn send_message(&mut self, data: Bytes) -> Result<()> {
        self.transport.send(self.ctx, self.peer, self.tag, &data)
    }

    fn recv_message(&mut self, capacity: usize) -> Result<Bytes> {
        let completion = self
            .transport
            .recv(self.ctx, self.peer, self.tag, Some(capacity))?;
        // Later chunks must come from the sender of the first one
        self.peer = completion.source;
        self.tag = completion.tag;
        Ok(completion.into_data())
    }
}
