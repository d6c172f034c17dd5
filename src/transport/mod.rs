//! The message-passing substrate.
//!
//! [`Transport`] is the boundary to the native point-to-point layer: blocking
//! and nonblocking byte messages addressed by context, rank and tag, plus
//! wait/test/cancel on native request handles. Everything above it (fixed
//! layouts, serialized values, requests, the large-object engine) is built in
//! this crate.
//!
//! [`LocalTransport`] is an in-process implementation that simulates a group
//! of ranks with threads.

mod local;

pub use local::{LocalTransport, TransportStats};

use bytes::Bytes;

use crate::error::Result;
use crate::status::Status;

/// Wildcard source rank for receives and probes (`MPI_ANY_SOURCE`).
pub const ANY_SOURCE: i32 = -1;

/// Wildcard tag for receives and probes (`MPI_ANY_TAG`).
pub const ANY_TAG: i32 = -1;

/// A communication context. Messages only match within the same context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u32);

impl ContextId {
    /// The context every rank starts with.
    pub const WORLD: ContextId = ContextId(0);
}

/// Opaque handle to an in-flight native operation.
///
/// A handle is consumed by the `wait` or `test` call that reports its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawRequest(pub u64);

/// What the transport reports for a finished native operation.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Source rank (the sender for receives, the local rank for sends).
    pub source: i32,
    /// Tag of the message.
    pub tag: i32,
    /// Bytes transferred; zero when cancelled.
    pub len: usize,
    /// The operation was cancelled before it took effect.
    pub cancelled: bool,
    /// Received bytes, for receives that completed normally.
    pub data: Option<Bytes>,
}

impl Completion {
    /// Status view of this completion with the count given in bytes.
    pub fn status(&self) -> Status {
        Status::new(self.source, self.tag, self.len as i64)
    }

    /// Received bytes, empty for sends and cancelled receives.
    pub fn into_data(self) -> Bytes {
        self.data.unwrap_or_default()
    }
}

/// Native point-to-point operations.
///
/// Implementations translate their native error codes into
/// [`Error::Transport`](crate::Error::Transport) at the failing call and never
/// retry.
pub trait Transport: Send + Sync {
    /// Rank of the calling process.
    fn rank(&self) -> i32;

    /// Number of processes in the group.
    fn size(&self) -> i32;

    /// Create a new context congruent with `ctx`.
    ///
    /// Collective: every rank must duplicate the same contexts in the same order.
    fn duplicate(&self, ctx: ContextId) -> Result<ContextId>;

    /// Blocking send.
    fn send(&self, ctx: ContextId, dest: i32, tag: i32, data: &[u8]) -> Result<()>;

    /// Blocking receive of one message of at most `capacity` bytes.
    fn recv(&self, ctx: ContextId, source: i32, tag: i32, capacity: Option<usize>)
        -> Result<Completion>;

    /// Start a nonblocking send. The transport keeps `data` alive until completion.
    fn isend(&self, ctx: ContextId, dest: i32, tag: i32, data: Bytes) -> Result<RawRequest>;

    /// Start a nonblocking receive of one message of at most `capacity` bytes.
    fn irecv(
        &self,
        ctx: ContextId,
        source: i32,
        tag: i32,
        capacity: Option<usize>,
    ) -> Result<RawRequest>;

    /// Block until the operation completes.
    fn wait(&self, request: RawRequest) -> Result<Completion>;

    /// Poll the operation; `None` means still pending.
    fn test(&self, request: RawRequest) -> Result<Option<Completion>>;

    /// Ask for cancellation. Completion must still be collected with `wait` or `test`.
    fn cancel(&self, request: RawRequest) -> Result<()>;

    /// Poll several operations, returning the first that completed.
    fn test_any(&self, requests: &[RawRequest]) -> Result<Option<(usize, Completion)>> {
        for (index, request) in requests.iter().enumerate() {
            if let Some(completion) = self.test(*request)? {
                return Ok(Some((index, completion)));
            }
        }
        Ok(None)
    }

    /// Block until a matching message is available, without receiving it.
    fn probe(&self, ctx: ContextId, source: i32, tag: i32) -> Result<Status>;

    /// Check for a matching message without blocking or receiving it.
    fn iprobe(&self, ctx: ContextId, source: i32, tag: i32) -> Result<Option<Status>>;
}
