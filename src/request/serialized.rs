//! Two-leg requests for serialized values.
//!
//! A serialized send puts the payload on the shadow channel under a freshly
//! leased tag, then sends a [`SerializedMessageHeader`] naming that tag on the
//! primary channel under the user's tag. Payloads of zero bytes skip the
//! shadow message entirely.
//!
//! A serialized receive first matches the header on the primary channel and
//! then posts the payload receive on the shadow channel from the header's
//! actual source, with the header's tag and exact length.

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Decoder, Finished, Leg, Operation, ReceiveRequest, Request, Value};
use crate::codec;
use crate::error::{Error, Result};
use crate::header::SerializedMessageHeader;
use crate::status::Status;
use crate::tag::{TagAllocator, TagLease};
use crate::transport::{ContextId, Transport};

/// A nonblocking send of a serialized value.
pub(crate) struct SerializedSend {
    /// Returned to the allocator when the operation is dropped.
    lease: Option<TagLease>,
    header: Leg,
    payload: Option<Leg>,
    bytes: usize,
}

impl SerializedSend {
    fn start<T: Serialize + ?Sized>(
        transport: &dyn Transport,
        channels: Channels,
        tags: &Arc<TagAllocator>,
        value: &T,
        dest: i32,
        tag: i32,
    ) -> Result<Self> {
        let lease = tags.lease();
        let payload = Bytes::from(codec::to_bytes(value)?);
        let header = SerializedMessageHeader {
            tag: lease.tag(),
            bytes: payload.len() as i64,
        };
        let header_bytes = Bytes::copy_from_slice(&header.to_wire());

        let mut payload_leg = None;
        if !payload.is_empty() {
            let handle = transport.isend(channels.shadow, dest, lease.tag(), payload.clone())?;
            payload_leg = Some(Leg::pinning(handle, payload.clone()));
        }
        let header_handle = match transport.isend(channels.primary, dest, tag, header_bytes.clone())
        {
            Ok(handle) => handle,
            Err(err) => {
                if let Some(leg) = payload_leg.as_mut() {
                    // Nobody will ever look for this payload
                    let _ = leg.cancel(transport).and_then(|()| leg.wait(transport));
                }
                return Err(err);
            }
        };

        let mut send = SerializedSend {
            bytes: payload.len(),
            lease: Some(lease),
            header: Leg::pinning(header_handle, header_bytes),
            payload: payload_leg,
        };
        // Drops the header pin early when the transport finished it already
        if let Err(err) = send.header.poll(transport) {
            send.abandon();
            return Err(err);
        }
        Ok(send)
    }

    /// Poll both legs. A failure leaks the tag unless the payload is known
    /// to be finished.
    pub(crate) fn test(&mut self, transport: &dyn Transport) -> Result<Option<Finished>> {
        let header_done = self.header.poll(transport);
        let payload_done = match self.payload.as_mut() {
            Some(leg) => leg.poll(transport),
            None => Ok(true),
        };
        let (header_done, payload_done) = match (header_done, payload_done) {
            (Ok(header), Ok(payload)) => (header, payload),
            (Err(err), Ok(true)) => return Err(err),
            (Err(err), _) | (Ok(_), Err(err)) => {
                self.leak_tag();
                return Err(err);
            }
        };
        if header_done && payload_done {
            self.finish().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Wait on both legs. The payload is driven to completion even when the
    /// header fails, so its tag is only returned once nothing can arrive
    /// under it.
    pub(crate) fn wait(&mut self, transport: &dyn Transport) -> Result<Finished> {
        let header = self.header.wait(transport);
        if let Some(leg) = self.payload.as_mut() {
            if let Err(err) = leg.wait(transport) {
                self.leak_tag();
                return Err(err);
            }
        }
        header?;
        self.finish()
    }

    /// Cancel both legs, then collect both completions.
    ///
    /// The first error is reported after both legs have been driven to
    /// completion, so the pins and the tag are released either way.
    pub(crate) fn cancel(&mut self, transport: &dyn Transport) -> Result<Finished> {
        let mut first_error = self.header.cancel(transport).err();
        if let Some(leg) = self.payload.as_mut() {
            if let Err(err) = leg.cancel(transport) {
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.header.wait(transport) {
            first_error.get_or_insert(err);
        }
        if let Some(leg) = self.payload.as_mut() {
            if let Err(err) = leg.wait(transport) {
                first_error.get_or_insert(err);
                self.leak_tag();
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => self.finish(),
        }
    }

    fn finish(&mut self) -> Result<Finished> {
        let payload_cancelled = self.payload.as_ref().is_some_and(Leg::was_cancelled);
        let header_cancelled = self.header.was_cancelled();
        let header = self.header.finished()?;
        if header_cancelled || payload_cancelled {
            return Ok(Finished::cancelled(header.source, header.tag));
        }
        Ok(Finished::completed(
            Status::new(header.source, header.tag, self.bytes as i64),
            None,
        ))
    }

    /// Leak the tag: a message may still be in flight under it.
    pub(crate) fn abandon(mut self) {
        self.leak_tag();
    }

    fn leak_tag(&mut self) {
        if let Some(lease) = self.lease.take() {
            tracing::warn!(tag = lease.tag(), "leaking shadow tag of an unfinished send");
            lease.leak();
        }
    }
}

enum Phase {
    Header(Leg),
    Payload {
        leg: Leg,
        /// Tag of the matched header, reported in the status.
        tag: i32,
        expected: usize,
    },
    Done,
}

/// A nonblocking receive of a serialized value.
pub(crate) struct SerializedReceive {
    shadow: ContextId,
    phase: Phase,
    decode: Option<Decoder>,
}

impl SerializedReceive {
    fn start(
        transport: &dyn Transport,
        channels: Channels,
        source: i32,
        tag: i32,
        decode: Decoder,
    ) -> Result<Self> {
        let handle = transport.irecv(
            channels.primary,
            source,
            tag,
            Some(SerializedMessageHeader::WIRE_SIZE),
        )?;
        Ok(SerializedReceive {
            shadow: channels.shadow,
            phase: Phase::Header(Leg::new(handle)),
            decode: Some(decode),
        })
    }

    pub(crate) fn test(&mut self, transport: &dyn Transport) -> Result<Option<Finished>> {
        if let Phase::Header(leg) = &mut self.phase {
            if !leg.poll(transport)? {
                return Ok(None);
            }
            if let Some(finished) = self.begin_payload(transport)? {
                return Ok(Some(finished));
            }
        }
        if let Phase::Payload { leg, .. } = &mut self.phase {
            if !leg.poll(transport)? {
                return Ok(None);
            }
        }
        self.complete_payload().map(Some)
    }

    pub(crate) fn wait(&mut self, transport: &dyn Transport) -> Result<Finished> {
        if let Phase::Header(leg) = &mut self.phase {
            leg.wait(transport)?;
            if let Some(finished) = self.begin_payload(transport)? {
                return Ok(finished);
            }
        }
        if let Phase::Payload { leg, .. } = &mut self.phase {
            leg.wait(transport)?;
        }
        self.complete_payload()
    }

    /// Cancel the header receive if it has not matched yet.
    ///
    /// If the header already matched, the sender is committed to the payload
    /// and the receive runs to completion instead. Cancelling the payload
    /// would strand it on the shadow channel under a tag the sender reuses.
    pub(crate) fn cancel(&mut self, transport: &dyn Transport) -> Result<Finished> {
        if let Phase::Header(leg) = &mut self.phase {
            leg.cancel(transport)?;
            leg.wait(transport)?;
            if let Some(finished) = self.begin_payload(transport)? {
                return Ok(finished);
            }
        }
        if let Phase::Payload { leg, .. } = &mut self.phase {
            leg.wait(transport)?;
        }
        self.complete_payload()
    }

    /// Consume the matched header. Returns the result directly when there is
    /// no payload to wait for.
    fn begin_payload(&mut self, transport: &dyn Transport) -> Result<Option<Finished>> {
        let Phase::Header(mut leg) = std::mem::replace(&mut self.phase, Phase::Done) else {
            return Err(Error::Internal("header phase already over".into()));
        };
        let completion = leg.finished()?;
        if completion.cancelled {
            return Ok(Some(Finished::cancelled(completion.source, completion.tag)));
        }
        let (source, tag) = (completion.source, completion.tag);
        let header = SerializedMessageHeader::from_wire(&completion.into_data())?;
        if header.bytes == 0 {
            let value = self.decode(Bytes::new())?;
            return Ok(Some(Finished::completed(Status::new(source, tag, 0), Some(value))));
        }
        let expected = header.payload_len();
        let handle = transport.irecv(self.shadow, source, header.tag, Some(expected))?;
        self.phase = Phase::Payload {
            leg: Leg::new(handle),
            tag,
            expected,
        };
        Ok(None)
    }

    fn complete_payload(&mut self) -> Result<Finished> {
        let Phase::Payload {
            mut leg,
            tag,
            expected,
        } = std::mem::replace(&mut self.phase, Phase::Done)
        else {
            return Err(Error::Internal("payload phase not reached".into()));
        };
        let completion = leg.finished()?;
        if completion.cancelled {
            return Ok(Finished::cancelled(completion.source, tag));
        }
        if completion.len != expected {
            return Err(Error::Protocol(format!(
                "header announced {expected} payload bytes, received {}",
                completion.len
            )));
        }
        let status = Status::new(completion.source, tag, completion.len as i64);
        let value = self.decode(completion.into_data())?;
        Ok(Finished::completed(status, Some(value)))
    }

    fn decode(&mut self, bytes: Bytes) -> Result<Value> {
        let decode = self
            .decode
            .take()
            .ok_or_else(|| Error::Internal("receive decoded twice".into()))?;
        decode(bytes)
    }
}

/// The primary and shadow contexts of a communicator.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Channels {
    pub(crate) primary: ContextId,
    pub(crate) shadow: ContextId,
}

/// Start a two-leg send of a serialized value.
pub(crate) fn isend_serialized<T: Serialize + ?Sized>(
    transport: &Arc<dyn Transport>,
    channels: Channels,
    tags: &Arc<TagAllocator>,
    value: &T,
    dest: i32,
    tag: i32,
) -> Result<Request> {
    let send = SerializedSend::start(transport.as_ref(), channels, tags, value, dest, tag)?;
    Ok(Request::new(Arc::clone(transport), Operation::SerializedSend(send)))
}

/// Start a two-leg receive of a serialized value.
pub(crate) fn irecv_serialized<T: DeserializeOwned + Send + 'static>(
    transport: &Arc<dyn Transport>,
    channels: Channels,
    source: i32,
    tag: i32,
) -> Result<ReceiveRequest<T>> {
    let decode: Decoder =
        Box::new(|bytes: Bytes| -> Result<Value> { Ok(Box::new(codec::from_bytes::<T>(&bytes)?)) });
    let receive = SerializedReceive::start(transport.as_ref(), channels, source, tag, decode)?;
    Ok(ReceiveRequest::new(Request::new(
        Arc::clone(transport),
        Operation::SerializedReceive(receive),
    )))
}

/// Start a two-leg receive of a serialized array into `destination`.
///
/// Received elements overwrite the front of `destination`; a received array
/// longer than the destination fails with [`Error::Overflow`]. The buffer is
/// handed back as the request's value.
pub(crate) fn irecv_serialized_into<T: DeserializeOwned + Send + 'static>(
    transport: &Arc<dyn Transport>,
    channels: Channels,
    mut destination: Vec<T>,
    source: i32,
    tag: i32,
) -> Result<ReceiveRequest<Vec<T>>> {
    let decode: Decoder = Box::new(move |bytes: Bytes| -> Result<Value> {
        let received: Vec<T> = codec::from_bytes(&bytes)?;
        if received.len() > destination.len() {
            return Err(Error::Overflow {
                received: received.len(),
                capacity: destination.len(),
            });
        }
        for (slot, value) in destination.iter_mut().zip(received) {
            *slot = value;
        }
        Ok(Box::new(destination))
    });
    let receive = SerializedReceive::start(transport.as_ref(), channels, source, tag, decode)?;
    Ok(ReceiveRequest::new(Request::new(
        Arc::clone(transport),
        Operation::SerializedArrayReceive(receive),
    )))
}
