//! Request handles for nonblocking operations.
//!
//! Every nonblocking operation returns a [`Request`]. A request is a small
//! state machine: it starts `Pending`, and the first successful `wait`, `test`
//! or `cancel` that observes completion moves it to `Completed` or `Cancelled`.
//! Terminal states are cached, so later calls return the same [`Status`]
//! without touching the transport again. A failure moves the request to
//! `Failed`; its resources are released at that point and later calls return
//! [`Error::InvalidRequest`].
//!
//! Serialized operations are composites of two native operations (a header on
//! the primary channel and a payload on the shadow channel). They report
//! completion only once both legs are done.

mod fixed;
mod list;
mod serialized;

pub use list::RequestList;

pub(crate) use fixed::{irecv_array, irecv_value, isend_array, isend_value};
pub(crate) use serialized::{
    irecv_serialized, irecv_serialized_into, isend_serialized, Channels,
};

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::status::Status;
use crate::transport::{Completion, RawRequest, Transport};

/// A received value with its type erased.
pub(crate) type Value = Box<dyn Any + Send>;

/// Turns the received bytes of a receive into its value.
pub(crate) type Decoder = Box<dyn FnOnce(Bytes) -> Result<Value> + Send>;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    fn next() -> Self {
        RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw identifier.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which operation a request tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Send of one fixed-layout value
    FixedValueSend,
    /// Send of a slice of fixed-layout values
    FixedArraySend,
    /// Two-leg send of a serialized value
    SerializedSend,
    /// Receive of one fixed-layout value
    FixedValueReceive,
    /// Receive of a slice of fixed-layout values
    FixedArrayReceive,
    /// Two-leg receive of a serialized value
    SerializedReceive,
    /// Two-leg receive of a serialized array into a caller buffer
    SerializedArrayReceive,
}

impl RequestKind {
    /// True for the receive kinds, which produce a value.
    pub fn is_receive(self) -> bool {
        matches!(
            self,
            RequestKind::FixedValueReceive
                | RequestKind::FixedArrayReceive
                | RequestKind::SerializedReceive
                | RequestKind::SerializedArrayReceive
        )
    }
}

/// How a pending operation ended.
pub(crate) struct Finished {
    pub(crate) status: Status,
    pub(crate) cancelled: bool,
    pub(crate) value: Option<Value>,
}

impl Finished {
    pub(crate) fn completed(status: Status, value: Option<Value>) -> Self {
        Finished {
            status,
            cancelled: false,
            value,
        }
    }

    pub(crate) fn cancelled(source: i32, tag: i32) -> Self {
        Finished {
            status: Status::cancelled(source, tag),
            cancelled: true,
            value: None,
        }
    }
}

/// The in-flight part of a request.
pub(crate) enum Operation {
    FixedValueSend(fixed::FixedSend),
    FixedArraySend(fixed::FixedSend),
    SerializedSend(serialized::SerializedSend),
    FixedValueReceive(fixed::FixedReceive),
    FixedArrayReceive(fixed::FixedReceive),
    SerializedReceive(serialized::SerializedReceive),
    SerializedArrayReceive(serialized::SerializedReceive),
}

impl Operation {
    fn kind(&self) -> RequestKind {
        match self {
            Operation::FixedValueSend(_) => RequestKind::FixedValueSend,
            Operation::FixedArraySend(_) => RequestKind::FixedArraySend,
            Operation::SerializedSend(_) => RequestKind::SerializedSend,
            Operation::FixedValueReceive(_) => RequestKind::FixedValueReceive,
            Operation::FixedArrayReceive(_) => RequestKind::FixedArrayReceive,
            Operation::SerializedReceive(_) => RequestKind::SerializedReceive,
            Operation::SerializedArrayReceive(_) => RequestKind::SerializedArrayReceive,
        }
    }

    fn test(&mut self, transport: &dyn Transport) -> Result<Option<Finished>> {
        match self {
            Operation::FixedValueSend(op) | Operation::FixedArraySend(op) => op.test(transport),
            Operation::SerializedSend(op) => op.test(transport),
            Operation::FixedValueReceive(op) | Operation::FixedArrayReceive(op) => {
                op.test(transport)
            }
            Operation::SerializedReceive(op) | Operation::SerializedArrayReceive(op) => {
                op.test(transport)
            }
        }
    }

    fn wait(&mut self, transport: &dyn Transport) -> Result<Finished> {
        match self {
            Operation::FixedValueSend(op) | Operation::FixedArraySend(op) => op.wait(transport),
            Operation::SerializedSend(op) => op.wait(transport),
            Operation::FixedValueReceive(op) | Operation::FixedArrayReceive(op) => {
                op.wait(transport)
            }
            Operation::SerializedReceive(op) | Operation::SerializedArrayReceive(op) => {
                op.wait(transport)
            }
        }
    }

    fn cancel(&mut self, transport: &dyn Transport) -> Result<Finished> {
        match self {
            Operation::FixedValueSend(op) | Operation::FixedArraySend(op) => op.cancel(transport),
            Operation::SerializedSend(op) => op.cancel(transport),
            Operation::FixedValueReceive(op) | Operation::FixedArrayReceive(op) => {
                op.cancel(transport)
            }
            Operation::SerializedReceive(op) | Operation::SerializedArrayReceive(op) => {
                op.cancel(transport)
            }
        }
    }

    /// Give up on the operation without waiting for it.
    fn abandon(self) {
        if let Operation::SerializedSend(op) = self {
            op.abandon();
        }
    }
}

enum State {
    Pending(Operation),
    Completed(Status),
    Cancelled(Status),
    Failed,
}

/// A handle to a nonblocking operation.
///
/// `wait`, `test` and `cancel` take `&mut self` and may be called any number
/// of times: once the request has reached a terminal state they return the
/// cached status. A receive's value stays inside the request until it is
/// taken with [`Request::take_value`] (or through the typed
/// [`ReceiveRequest`] wrapper).
///
/// Dropping a request that is still pending is a programming error: the
/// transport may still be using its buffers. The request logs an error and
/// leaks its shadow-channel tag so the tag can never be reused while a
/// message might still be in flight.
///
/// # Example
///
/// ```
/// use std::thread;
/// use ferrompi_serde::{Communicator, EngineConfig, LocalTransport};
///
/// let handles: Vec<_> = LocalTransport::group(2)
///     .into_iter()
///     .map(|transport| {
///         thread::spawn(move || {
///             let comm = Communicator::new(transport, EngineConfig::default()).unwrap();
///             if comm.rank() == 0 {
///                 let mut request = comm.isend_serialized(&vec!["a", "b"], 1, 3).unwrap();
///                 let status = request.wait().unwrap();
///                 // Terminal states are cached
///                 assert_eq!(request.wait().unwrap(), status);
///             } else {
///                 let request = comm.irecv_serialized::<Vec<String>>(0, 3).unwrap();
///                 let (words, status) = request.wait_value().unwrap();
///                 assert_eq!(words, ["a", "b"]);
///                 assert_eq!(status.source, 0);
///             }
///         })
///     })
///     .collect();
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// ```
pub struct Request {
    id: RequestId,
    kind: RequestKind,
    transport: Arc<dyn Transport>,
    state: State,
    value: Option<Value>,
}

impl Request {
    pub(crate) fn new(transport: Arc<dyn Transport>, operation: Operation) -> Self {
        Request {
            id: RequestId::next(),
            kind: operation.kind(),
            transport,
            state: State::Pending(operation),
            value: None,
        }
    }

    /// Identity of this request.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Which operation this request tracks.
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// True until the request reaches a terminal state.
    pub fn is_pending(&self) -> bool {
        matches!(self.state, State::Pending(_))
    }

    /// True if the request completed normally.
    pub fn is_completed(&self) -> bool {
        matches!(self.state, State::Completed(_))
    }

    /// True if the request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.state, State::Cancelled(_))
    }

    /// The cached status of a finished request.
    pub fn status(&self) -> Option<Status> {
        match self.state {
            State::Completed(status) | State::Cancelled(status) => Some(status),
            State::Pending(_) | State::Failed => None,
        }
    }

    /// Block until the operation completes.
    pub fn wait(&mut self) -> Result<Status> {
        let outcome = match &mut self.state {
            State::Completed(status) | State::Cancelled(status) => return Ok(*status),
            State::Failed => return Err(Error::InvalidRequest),
            State::Pending(operation) => operation.wait(self.transport.as_ref()),
        };
        self.settle(outcome)
    }

    /// Check for completion without blocking.
    ///
    /// Returns `None` while the operation is still in flight.
    pub fn test(&mut self) -> Result<Option<Status>> {
        let outcome = match &mut self.state {
            State::Completed(status) | State::Cancelled(status) => return Ok(Some(*status)),
            State::Failed => return Err(Error::InvalidRequest),
            State::Pending(operation) => match operation.test(self.transport.as_ref()) {
                Ok(None) => return Ok(None),
                Ok(Some(finished)) => Ok(finished),
                Err(err) => Err(err),
            },
        };
        self.settle(outcome).map(Some)
    }

    /// Attempt to cancel the operation and wait for it to reach a terminal state.
    ///
    /// Cancellation can lose the race with completion; check
    /// [`Request::is_cancelled`] to see which happened. Cancelling a finished
    /// request returns its cached status.
    pub fn cancel(&mut self) -> Result<Status> {
        let outcome = match &mut self.state {
            State::Completed(status) | State::Cancelled(status) => return Ok(*status),
            State::Failed => return Err(Error::InvalidRequest),
            State::Pending(operation) => operation.cancel(self.transport.as_ref()),
        };
        self.settle(outcome)
    }

    /// Borrow the received value, if this is a completed receive of a `T`.
    pub fn value<T: 'static>(&self) -> Option<&T> {
        self.value.as_ref()?.downcast_ref::<T>()
    }

    /// Take the received value, if this is a completed receive of a `T`.
    pub fn take_value<T: 'static>(&mut self) -> Option<T> {
        match self.value.take()?.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(value) => {
                self.value = Some(value);
                None
            }
        }
    }

    /// Record the end of the operation. The operation is dropped here, which
    /// releases its pinned buffers and shadow tag exactly once.
    fn settle(&mut self, outcome: Result<Finished>) -> Result<Status> {
        drop(std::mem::replace(&mut self.state, State::Failed));
        match outcome {
            Ok(finished) => {
                self.value = finished.value;
                self.state = if finished.cancelled {
                    State::Cancelled(finished.status)
                } else {
                    State::Completed(finished.status)
                };
                tracing::trace!(request = %self.id, kind = ?self.kind, status = ?finished.status, "request finished");
                Ok(finished.status)
            }
            Err(err) => {
                tracing::debug!(request = %self.id, kind = ?self.kind, error = %err, "request failed");
                Err(err)
            }
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Pending(_) => "pending",
            State::Completed(_) => "completed",
            State::Cancelled(_) => "cancelled",
            State::Failed => "failed",
        };
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &state)
            .finish()
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let State::Pending(operation) = std::mem::replace(&mut self.state, State::Failed) {
            tracing::error!(
                request = %self.id,
                kind = ?self.kind,
                "request dropped while pending; its transfer is abandoned"
            );
            if !tracing::dispatcher::has_been_set() {
                eprintln!(
                    "ferrompi-serde: request {} ({:?}) dropped while pending; its transfer is abandoned",
                    self.id, self.kind
                );
            }
            operation.abandon();
        }
    }
}

/// A receive request that knows the type of its value.
///
/// Converts into a plain [`Request`] for use in a [`RequestList`].
pub struct ReceiveRequest<T> {
    request: Request,
    _value: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> ReceiveRequest<T> {
    pub(crate) fn new(request: Request) -> Self {
        ReceiveRequest {
            request,
            _value: PhantomData,
        }
    }

    /// Identity of the underlying request.
    pub fn id(&self) -> RequestId {
        self.request.id()
    }

    /// Which receive this is.
    pub fn kind(&self) -> RequestKind {
        self.request.kind()
    }

    /// See [`Request::wait`].
    pub fn wait(&mut self) -> Result<Status> {
        self.request.wait()
    }

    /// See [`Request::test`].
    pub fn test(&mut self) -> Result<Option<Status>> {
        self.request.test()
    }

    /// See [`Request::cancel`].
    pub fn cancel(&mut self) -> Result<Status> {
        self.request.cancel()
    }

    /// See [`Request::is_cancelled`].
    pub fn is_cancelled(&self) -> bool {
        self.request.is_cancelled()
    }

    /// See [`Request::status`].
    pub fn status(&self) -> Option<Status> {
        self.request.status()
    }

    /// The received value, once the receive has completed.
    pub fn value(&self) -> Option<&T> {
        self.request.value::<T>()
    }

    /// Take the received value out of the request.
    pub fn take_value(&mut self) -> Option<T> {
        self.request.take_value::<T>()
    }

    /// Wait for the receive and return its value.
    ///
    /// Fails with [`Error::Cancelled`] if the receive was cancelled.
    pub fn wait_value(mut self) -> Result<(T, Status)> {
        let status = self.request.wait()?;
        match self.request.take_value::<T>() {
            Some(value) => Ok((value, status)),
            None if self.request.is_cancelled() => Err(Error::Cancelled),
            None => Err(Error::Internal("completed receive holds no value".into())),
        }
    }

    /// The untyped request.
    pub fn into_request(self) -> Request {
        self.request
    }
}

impl<T> fmt::Debug for ReceiveRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReceiveRequest").field(&self.request).finish()
    }
}

impl<T> From<ReceiveRequest<T>> for Request {
    fn from(request: ReceiveRequest<T>) -> Self {
        request.request
    }
}

/// One native operation inside a request.
///
/// The completion is kept once observed, so a leg never calls the transport
/// again after it is done. A send leg pins its buffer until then.
pub(crate) struct Leg {
    handle: RawRequest,
    completion: Option<Completion>,
    pinned: Option<Bytes>,
}

impl Leg {
    pub(crate) fn new(handle: RawRequest) -> Self {
        Leg {
            handle,
            completion: None,
            pinned: None,
        }
    }

    /// A send leg whose buffer stays alive until the send completes.
    pub(crate) fn pinning(handle: RawRequest, buffer: Bytes) -> Self {
        Leg {
            handle,
            completion: None,
            pinned: Some(buffer),
        }
    }

    /// Test the native operation unless it already finished.
    pub(crate) fn poll(&mut self, transport: &dyn Transport) -> Result<bool> {
        if self.completion.is_none() {
            self.completion = transport.test(self.handle)?;
            self.unpin();
        }
        Ok(self.completion.is_some())
    }

    /// Wait on the native operation unless it already finished.
    pub(crate) fn wait(&mut self, transport: &dyn Transport) -> Result<()> {
        if self.completion.is_none() {
            self.completion = Some(transport.wait(self.handle)?);
            self.unpin();
        }
        Ok(())
    }

    /// Request cancellation unless the operation already finished.
    pub(crate) fn cancel(&mut self, transport: &dyn Transport) -> Result<()> {
        if self.completion.is_none() {
            transport.cancel(self.handle)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    fn unpin(&mut self) {
        if self.completion.is_some() {
            if let Some(buffer) = self.pinned.take() {
                tracing::trace!(bytes = buffer.len(), "send buffer released");
            }
        }
    }

    /// The completion of a finished leg.
    pub(crate) fn finished(&mut self) -> Result<Completion> {
        self.completion
            .take()
            .ok_or_else(|| Error::Internal("leg has not finished".into()))
    }

    pub(crate) fn was_cancelled(&self) -> bool {
        self.completion.as_ref().is_some_and(|c| c.cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::comm::Communicator;
    use crate::transport::LocalTransport;

    fn pair() -> (Communicator, Communicator, Vec<Arc<LocalTransport>>) {
        let ranks = LocalTransport::group(2);
        let a = Communicator::new(ranks[0].clone(), EngineConfig::default()).unwrap();
        let b = Communicator::new(ranks[1].clone(), EngineConfig::default()).unwrap();
        (a, b, ranks)
    }

    #[test]
    fn request_ids_are_unique() {
        let a = RequestId::next();
        let b = RequestId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn kinds_report_direction() {
        assert!(RequestKind::SerializedArrayReceive.is_receive());
        assert!(!RequestKind::SerializedSend.is_receive());
    }

    #[test]
    fn terminal_state_is_idempotent() {
        let (a, b, ranks) = pair();
        let mut send = a.isend_value(41i32, 1, 2).unwrap();
        let mut recv = b.irecv_value::<i32>(0, 2).unwrap();

        let first = recv.wait().unwrap();
        let calls = ranks[1].stats().native_calls();
        assert_eq!(recv.wait().unwrap(), first);
        assert_eq!(recv.test().unwrap(), Some(first));
        assert_eq!(recv.cancel().unwrap(), first);
        assert_eq!(ranks[1].stats().native_calls(), calls);
        assert_eq!(recv.value(), Some(&41));

        send.wait().unwrap();
        let calls = ranks[0].stats().native_calls();
        send.test().unwrap();
        send.wait().unwrap();
        assert_eq!(ranks[0].stats().native_calls(), calls);
    }

    #[test]
    fn failed_request_becomes_invalid() {
        let (a, b, _ranks) = pair();
        // Two elements into room for one
        a.send(&[1i32, 2], 1, 0).unwrap();
        let mut recv = b.irecv::<i32>(0, 0, 1).unwrap();
        assert!(recv.wait().is_err());
        assert!(matches!(recv.wait(), Err(Error::InvalidRequest)));
        assert!(matches!(recv.test(), Err(Error::InvalidRequest)));
        assert!(recv.status().is_none());
    }

    #[test]
    fn take_value_checks_type() {
        let (a, b, _ranks) = pair();
        a.send(&[7u64], 1, 1).unwrap();
        let mut recv: Request = b.irecv_value::<u64>(0, 1).unwrap().into();
        recv.wait().unwrap();
        assert!(recv.take_value::<i32>().is_none());
        assert_eq!(recv.take_value::<u64>(), Some(7));
        assert!(recv.take_value::<u64>().is_none());
    }

    #[test]
    fn wait_value_of_cancelled_receive_fails() {
        let (_a, b, _ranks) = pair();
        let mut recv = b.irecv_value::<f64>(0, 9).unwrap();
        recv.cancel().unwrap();
        assert!(recv.is_cancelled());
        assert!(matches!(recv.wait_value(), Err(Error::Cancelled)));
    }

    #[test]
    fn dropping_pending_send_leaks_its_tag() {
        let (a, b, ranks) = pair();
        ranks[0].hold_sends(true);
        let request = a.isend_serialized(&String::from("lost"), 1, 4).unwrap();
        let tag = a.tags().allocate();
        a.tags().release(tag);
        drop(request);
        // The abandoned send's tag (1) is never handed out again
        assert_eq!(a.tags().allocate(), tag);
        assert_ne!(a.tags().allocate(), 1);
        ranks[0].release_sends(None);
        let (value, _) = b.recv_serialized::<String>(0, 4).unwrap();
        assert_eq!(value, "lost");
    }
}
