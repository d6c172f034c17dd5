//! Single-leg requests for fixed-layout data.

use std::sync::Arc;

use bytes::Bytes;

use super::{Decoder, Finished, Leg, Operation, ReceiveRequest, Request, Value};
use crate::datatype::{decode_slice, element_count, encode_slice, MpiDatatype};
use crate::error::{Error, Result};
use crate::status::Status;
use crate::transport::{Completion, ContextId, Transport};

/// A nonblocking send of fixed-layout data.
pub(crate) struct FixedSend {
    leg: Leg,
    element_size: usize,
}

impl FixedSend {
    fn start(
        transport: &dyn Transport,
        ctx: ContextId,
        dest: i32,
        tag: i32,
        data: Bytes,
        element_size: usize,
    ) -> Result<Self> {
        let handle = transport.isend(ctx, dest, tag, data.clone())?;
        Ok(FixedSend {
            leg: Leg::pinning(handle, data),
            element_size,
        })
    }

    pub(crate) fn test(&mut self, transport: &dyn Transport) -> Result<Option<Finished>> {
        if !self.leg.poll(transport)? {
            return Ok(None);
        }
        self.finish().map(Some)
    }

    pub(crate) fn wait(&mut self, transport: &dyn Transport) -> Result<Finished> {
        self.leg.wait(transport)?;
        self.finish()
    }

    pub(crate) fn cancel(&mut self, transport: &dyn Transport) -> Result<Finished> {
        self.leg.cancel(transport)?;
        self.wait(transport)
    }

    fn finish(&mut self) -> Result<Finished> {
        let completion = self.leg.finished()?;
        if completion.cancelled {
            return Ok(Finished::cancelled(completion.source, completion.tag));
        }
        Ok(Finished::completed(
            count_status(&completion, self.element_size),
            None,
        ))
    }
}

/// A nonblocking receive of fixed-layout data.
pub(crate) struct FixedReceive {
    leg: Leg,
    element_size: usize,
    decode: Option<Decoder>,
}

impl FixedReceive {
    fn start(
        transport: &dyn Transport,
        ctx: ContextId,
        source: i32,
        tag: i32,
        capacity: usize,
        element_size: usize,
        decode: Decoder,
    ) -> Result<Self> {
        let handle = transport.irecv(ctx, source, tag, Some(capacity))?;
        Ok(FixedReceive {
            leg: Leg::new(handle),
            element_size,
            decode: Some(decode),
        })
    }

    pub(crate) fn test(&mut self, transport: &dyn Transport) -> Result<Option<Finished>> {
        if !self.leg.poll(transport)? {
            return Ok(None);
        }
        self.finish().map(Some)
    }

    pub(crate) fn wait(&mut self, transport: &dyn Transport) -> Result<Finished> {
        self.leg.wait(transport)?;
        self.finish()
    }

    pub(crate) fn cancel(&mut self, transport: &dyn Transport) -> Result<Finished> {
        self.leg.cancel(transport)?;
        self.wait(transport)
    }

    fn finish(&mut self) -> Result<Finished> {
        let completion = self.leg.finished()?;
        if completion.cancelled {
            return Ok(Finished::cancelled(completion.source, completion.tag));
        }
        let status = count_status(&completion, self.element_size);
        let decode = self
            .decode
            .take()
            .ok_or_else(|| Error::Internal("receive decoded twice".into()))?;
        let value = decode(completion.into_data())?;
        Ok(Finished::completed(status, Some(value)))
    }
}

fn count_status(completion: &Completion, element_size: usize) -> Status {
    let count = if element_size == 0 {
        0
    } else {
        (completion.len / element_size) as i64
    };
    Status::new(completion.source, completion.tag, count)
}

/// Start a send of one fixed-layout value.
pub(crate) fn isend_value<T: MpiDatatype>(
    transport: &Arc<dyn Transport>,
    ctx: ContextId,
    value: T,
    dest: i32,
    tag: i32,
) -> Result<Request> {
    let send = FixedSend::start(
        transport.as_ref(),
        ctx,
        dest,
        tag,
        encode_slice(&[value]),
        T::WIRE_SIZE,
    )?;
    Ok(Request::new(Arc::clone(transport), Operation::FixedValueSend(send)))
}

/// Start a send of a slice of fixed-layout values.
///
/// The slice is copied into a pinned buffer, so the caller's data may be
/// reused immediately.
pub(crate) fn isend_array<T: MpiDatatype>(
    transport: &Arc<dyn Transport>,
    ctx: ContextId,
    data: &[T],
    dest: i32,
    tag: i32,
) -> Result<Request> {
    let send = FixedSend::start(
        transport.as_ref(),
        ctx,
        dest,
        tag,
        encode_slice(data),
        T::WIRE_SIZE,
    )?;
    Ok(Request::new(Arc::clone(transport), Operation::FixedArraySend(send)))
}

/// Start a receive of one fixed-layout value.
pub(crate) fn irecv_value<T: MpiDatatype>(
    transport: &Arc<dyn Transport>,
    ctx: ContextId,
    source: i32,
    tag: i32,
) -> Result<ReceiveRequest<T>> {
    let decode: Decoder = Box::new(|bytes: Bytes| -> Result<Value> {
        let values = decode_slice::<T>(&bytes)?;
        match values.as_slice() {
            [value] => Ok(Box::new(*value)),
            _ => Err(Error::Protocol(format!(
                "expected one element, received {}",
                element_count::<T>(bytes.len())
            ))),
        }
    });
    let receive = FixedReceive::start(
        transport.as_ref(),
        ctx,
        source,
        tag,
        T::WIRE_SIZE,
        T::WIRE_SIZE,
        decode,
    )?;
    Ok(ReceiveRequest::new(Request::new(
        Arc::clone(transport),
        Operation::FixedValueReceive(receive),
    )))
}

/// Start a receive of up to `count` fixed-layout values.
pub(crate) fn irecv_array<T: MpiDatatype>(
    transport: &Arc<dyn Transport>,
    ctx: ContextId,
    source: i32,
    tag: i32,
    count: usize,
) -> Result<ReceiveRequest<Vec<T>>> {
    let decode: Decoder =
        Box::new(|bytes: Bytes| -> Result<Value> { Ok(Box::new(decode_slice::<T>(&bytes)?)) });
    let receive = FixedReceive::start(
        transport.as_ref(),
        ctx,
        source,
        tag,
        count * T::WIRE_SIZE,
        T::WIRE_SIZE,
        decode,
    )?;
    Ok(ReceiveRequest::new(Request::new(
        Arc::clone(transport),
        Operation::FixedArrayReceive(receive),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestKind;
    use crate::transport::LocalTransport;

    const CTX: ContextId = ContextId::WORLD;

    fn group() -> Vec<Arc<dyn Transport>> {
        LocalTransport::group(2)
            .into_iter()
            .map(|t| t as Arc<dyn Transport>)
            .collect()
    }

    #[test]
    fn value_round_trip_reports_element_count() {
        let ranks = group();
        let mut send = isend_value(&ranks[0], CTX, 2.5f64, 1, 8).unwrap();
        assert_eq!(send.kind(), RequestKind::FixedValueSend);
        let mut recv = irecv_value::<f64>(&ranks[1], CTX, 0, 8).unwrap();
        let status = recv.wait().unwrap();
        assert_eq!(status, Status::new(0, 8, 1));
        assert_eq!(recv.take_value(), Some(2.5));
        assert_eq!(send.wait().unwrap().count, 1);
    }

    #[test]
    fn array_receive_may_be_shorter_than_capacity() {
        let ranks = group();
        let mut send = isend_array(&ranks[0], CTX, &[1u32, 2, 3], 1, 0).unwrap();
        let recv = irecv_array::<u32>(&ranks[1], CTX, 0, 0, 10).unwrap();
        assert_eq!(recv.kind(), RequestKind::FixedArrayReceive);
        let (values, status) = recv.wait_value().unwrap();
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(status.count, 3);
        send.wait().unwrap();
    }

    #[test]
    fn test_polls_until_message_arrives() {
        let ranks = group();
        let mut recv = irecv_value::<i64>(&ranks[1], CTX, 0, 3).unwrap();
        assert_eq!(recv.test().unwrap(), None);
        let mut send = isend_value(&ranks[0], CTX, -9i64, 1, 3).unwrap();
        send.wait().unwrap();
        assert_eq!(recv.test().unwrap(), Some(Status::new(0, 3, 1)));
        assert_eq!(recv.value(), Some(&-9));
    }

    #[test]
    fn oversized_message_fails_the_receive() {
        let ranks = group();
        let mut send = isend_array(&ranks[0], CTX, &[1u8, 2, 3, 4], 1, 0).unwrap();
        let mut recv = irecv_array::<u8>(&ranks[1], CTX, 0, 0, 2).unwrap();
        let err = recv.wait().unwrap_err();
        assert!(matches!(err, Error::Transport { .. }), "got: {err}");
        send.wait().unwrap();
    }

    #[test]
    fn cancelled_receive_has_no_value() {
        let ranks = group();
        let mut recv = irecv_value::<u8>(&ranks[1], CTX, 0, 1).unwrap();
        let status = recv.cancel().unwrap();
        assert!(recv.is_cancelled());
        assert_eq!(status.count, 0);
        assert!(recv.value().is_none());
    }
}
