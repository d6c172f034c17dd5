//! The communicator facade.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::datatype::{decode_slice, element_count, encode_slice, MpiDatatype};
use crate::engine::LargeObjectEngine;
use crate::error::{Error, Result};
use crate::request::{self, Channels, ReceiveRequest, Request};
use crate::status::Status;
use crate::tag::TagAllocator;
use crate::transport::{ContextId, Transport};

/// A group of ranks with a primary and a shadow channel.
///
/// Fixed-layout messages and the headers of serialized messages travel on
/// the primary channel. Serialized payloads and the chunk streams of bulk
/// operations travel on the shadow channel, a context duplicated from the
/// primary one when the communicator is created, so they can never be
/// matched by receives the caller posts.
///
/// Cloning a communicator shares its channels, tag allocator and engine.
/// Use [`duplicate`](Self::duplicate) for an independent communication
/// context.
///
/// # Example
///
/// ```
/// use std::thread;
/// use ferrompi_serde::{Communicator, EngineConfig, LocalTransport};
///
/// let handles: Vec<_> = LocalTransport::group(3)
///     .into_iter()
///     .map(|transport| {
///         thread::spawn(move || {
///             let world = Communicator::new(transport, EngineConfig::default()).unwrap();
///             let names = world
///                 .gather_serialized(format!("rank {}", world.rank()), 0)
///                 .unwrap();
///             if world.rank() == 0 {
///                 assert_eq!(names, ["rank 0", "rank 1", "rank 2"]);
///             }
///         })
///     })
///     .collect();
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// ```
#[derive(Clone)]
pub struct Communicator {
    transport: Arc<dyn Transport>,
    primary: ContextId,
    shadow: ContextId,
    tags: Arc<TagAllocator>,
    engine: Arc<LargeObjectEngine>,
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank())
            .field("size", &self.size())
            .field("primary", &self.primary)
            .field("shadow", &self.shadow)
            .finish()
    }
}

impl Communicator {
    /// Create the world communicator of `transport`.
    ///
    /// Collective: every rank of the group must call this, in the same order
    /// relative to other communicator creations, with equal `split_large_objects`
    /// and `buffer_size` settings.
    pub fn new<T: Transport + 'static>(transport: Arc<T>, config: EngineConfig) -> Result<Self> {
        Self::with_transport(transport, config)
    }

    /// Like [`new`](Self::new), for a transport already behind a trait object.
    pub fn with_transport(transport: Arc<dyn Transport>, config: EngineConfig) -> Result<Self> {
        let engine = Arc::new(LargeObjectEngine::new(config)?);
        let primary = ContextId::WORLD;
        let shadow = transport.duplicate(primary)?;
        tracing::debug!(
            rank = transport.rank(),
            size = transport.size(),
            ?primary,
            ?shadow,
            "communicator created"
        );
        Ok(Communicator {
            transport,
            primary,
            shadow,
            tags: Arc::new(TagAllocator::new()),
            engine,
        })
    }

    /// Rank of the calling process in this communicator.
    pub fn rank(&self) -> i32 {
        self.transport.rank()
    }

    /// Number of processes in this communicator.
    pub fn size(&self) -> i32 {
        self.transport.size()
    }

    /// Configuration of the large-object engine.
    pub fn config(&self) -> &EngineConfig {
        self.engine.config()
    }

    /// The large-object engine, for bulk operations over a subset of ranks.
    pub fn engine(&self) -> &Arc<LargeObjectEngine> {
        &self.engine
    }

    /// Duplicate this communicator.
    ///
    /// The duplicate has its own primary and shadow channels and its own tag
    /// allocator; it shares the engine and its worker pool. Collective.
    pub fn duplicate(&self) -> Result<Self> {
        let primary = self.transport.duplicate(self.primary)?;
        let shadow = self.transport.duplicate(primary)?;
        tracing::debug!(rank = self.rank(), ?primary, ?shadow, "communicator duplicated");
        Ok(Communicator {
            transport: Arc::clone(&self.transport),
            primary,
            shadow,
            tags: Arc::new(TagAllocator::new()),
            engine: Arc::clone(&self.engine),
        })
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn primary(&self) -> ContextId {
        self.primary
    }

    pub(crate) fn shadow(&self) -> ContextId {
        self.shadow
    }

    pub(crate) fn channels(&self) -> Channels {
        Channels {
            primary: self.primary,
            shadow: self.shadow,
        }
    }

    pub(crate) fn tags(&self) -> &Arc<TagAllocator> {
        &self.tags
    }

    fn all_ranks(&self) -> Vec<i32> {
        (0..self.size()).collect()
    }

    // ========================================================================
    // Fixed-layout point-to-point
    // ========================================================================

    /// Send a slice of fixed-layout values.
    pub fn send<T: MpiDatatype>(&self, data: &[T], dest: i32, tag: i32) -> Result<()> {
        self.transport
            .send(self.primary, dest, tag, &encode_slice(data))
    }

    /// Receive into `buf`.
    ///
    /// Use `source = ANY_SOURCE` and `tag = ANY_TAG` for wildcards. A message
    /// longer than `buf` fails with a `Truncate` transport error. The status
    /// count is the number of elements received.
    pub fn recv<T: MpiDatatype>(&self, buf: &mut [T], source: i32, tag: i32) -> Result<Status> {
        let completion =
            self.transport
                .recv(self.primary, source, tag, Some(buf.len() * T::WIRE_SIZE))?;
        let status = Status::new(
            completion.source,
            completion.tag,
            element_count::<T>(completion.len),
        );
        let values = decode_slice::<T>(&completion.into_data())?;
        buf[..values.len()].copy_from_slice(&values);
        Ok(status)
    }

    /// Start a nonblocking send of one value.
    pub fn isend_value<T: MpiDatatype>(&self, value: T, dest: i32, tag: i32) -> Result<Request> {
        request::isend_value(&self.transport, self.primary, value, dest, tag)
    }

    /// Start a nonblocking send of a slice. The data is copied, so `data` can be
    /// reused as soon as this returns.
    pub fn isend<T: MpiDatatype>(&self, data: &[T], dest: i32, tag: i32) -> Result<Request> {
        request::isend_array(&self.transport, self.primary, data, dest, tag)
    }

    /// Start a nonblocking receive of one value.
    pub fn irecv_value<T: MpiDatatype>(&self, source: i32, tag: i32) -> Result<ReceiveRequest<T>> {
        request::irecv_value(&self.transport, self.primary, source, tag)
    }

    /// Start a nonblocking receive of at most `count` values.
    pub fn irecv<T: MpiDatatype>(
        &self,
        source: i32,
        tag: i32,
        count: usize,
    ) -> Result<ReceiveRequest<Vec<T>>> {
        request::irecv_array(&self.transport, self.primary, source, tag, count)
    }

    /// Block until a matching message is available, without receiving it.
    ///
    /// The status count is the message length in bytes.
    pub fn probe(&self, source: i32, tag: i32) -> Result<Status> {
        self.transport.probe(self.primary, source, tag)
    }

    /// Check for a matching message without blocking or receiving it.
    pub fn iprobe(&self, source: i32, tag: i32) -> Result<Option<Status>> {
        self.transport.iprobe(self.primary, source, tag)
    }

    // ========================================================================
    // Serialized point-to-point
    // ========================================================================

    /// Send a serialized value, blocking until both the header and the
    /// payload have been handed off.
    pub fn send_serialized<T: Serialize + ?Sized>(&self, value: &T, dest: i32, tag: i32) -> Result<()> {
        self.isend_serialized(value, dest, tag)?.wait().map(|_| ())
    }

    /// Receive a value sent with [`send_serialized`](Self::send_serialized) or
    /// [`isend_serialized`](Self::isend_serialized).
    pub fn recv_serialized<T: DeserializeOwned + Send + 'static>(
        &self,
        source: i32,
        tag: i32,
    ) -> Result<(T, Status)> {
        self.irecv_serialized(source, tag)?.wait_value()
    }

    /// Start a nonblocking send of a serialized value.
    ///
    /// The value is encoded before this returns. The header goes out on the
    /// primary channel under `tag`; the payload goes out on the shadow
    /// channel under a tag drawn from this communicator's allocator, which is
    /// returned when the request completes.
    pub fn isend_serialized<T: Serialize + ?Sized>(
        &self,
        value: &T,
        dest: i32,
        tag: i32,
    ) -> Result<Request> {
        request::isend_serialized(&self.transport, self.channels(), &self.tags, value, dest, tag)
    }

    /// Start a nonblocking receive of a serialized value.
    pub fn irecv_serialized<T: DeserializeOwned + Send + 'static>(
        &self,
        source: i32,
        tag: i32,
    ) -> Result<ReceiveRequest<T>> {
        request::irecv_serialized(&self.transport, self.channels(), source, tag)
    }

    /// Start a nonblocking receive of a serialized array into `destination`.
    ///
    /// Received elements overwrite the front of `destination`, which is handed
    /// back as the request's value. A received array longer than
    /// `destination` fails with [`Error::Overflow`].
    pub fn irecv_serialized_into<T: DeserializeOwned + Send + 'static>(
        &self,
        destination: Vec<T>,
        source: i32,
        tag: i32,
    ) -> Result<ReceiveRequest<Vec<T>>> {
        request::irecv_serialized_into(&self.transport, self.channels(), destination, source, tag)
    }

    /// Send a value as a chunk stream. See [`LargeObjectEngine::send_large`].
    pub fn send_large<T: Serialize + ?Sized>(&self, value: &T, dest: i32, tag: i32) -> Result<()> {
        self.engine.send_large(self, value, dest, tag)
    }

    /// Receive a value sent with [`send_large`](Self::send_large).
    pub fn receive_large<T: DeserializeOwned>(&self, source: i32, tag: i32) -> Result<(T, Status)> {
        self.engine.receive_large(self, source, tag)
    }

    // ========================================================================
    // Serialized collectives
    // ========================================================================

    /// Gather one value from every rank at `root`.
    ///
    /// The root gets the values in rank order; other ranks get an empty vector.
    pub fn gather_serialized<T>(&self, value: T, root: i32) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let mut out = Vec::new();
        self.gather_serialized_into(value, root, &mut out)?;
        Ok(out)
    }

    /// Gather into a reusable buffer, which is only written at the root.
    pub fn gather_serialized_into<T>(&self, value: T, root: i32, out: &mut Vec<T>) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.engine
            .gather_large(self, &self.all_ranks(), value, root, out)
    }

    /// Hand `values[r]` to rank `r`. Only the root's `values` are read.
    pub fn scatter_serialized<T>(&self, values: Vec<T>, root: i32) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.engine
            .scatter_large(self, &self.all_ranks(), values, root)
    }

    /// Send the root's value to every rank.
    ///
    /// The root passes `Some(value)`; the values of other ranks are ignored.
    /// A root that passes `None` still takes part, and every rank then fails
    /// with [`Error::InvalidBuffer`]. Returning early at the root would leave
    /// the other ranks waiting forever.
    pub fn broadcast_serialized<T>(&self, value: Option<T>, root: i32) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
    {
        let values = if self.rank() == root {
            vec![value; self.size() as usize]
        } else {
            Vec::new()
        };
        self.scatter_serialized(values, root)?
            .ok_or(Error::InvalidBuffer)
    }

    /// Combine one value per rank with `op` at the root, in rank order.
    ///
    /// Returns `Some` at the root and `None` elsewhere.
    pub fn reduce_serialized<T, F>(&self, value: T, op: F, root: i32) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut(T, T) -> T,
    {
        let gathered = self.gather_serialized(value, root)?;
        if self.rank() != root {
            return Ok(None);
        }
        Ok(gathered.into_iter().reduce(op))
    }

    /// Send `values[r]` to rank `r` and receive one value from every rank,
    /// in rank order.
    pub fn alltoall_serialized<T>(&self, values: Vec<T>) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let mut out = Vec::new();
        self.engine
            .alltoall(self, &self.all_ranks(), values, &mut out)?;
        Ok(out)
    }

    /// All-to-all over a flat array.
    /// See [`LargeObjectEngine::alltoall_flattened`].
    pub fn alltoall_flattened<T>(
        &self,
        values: Vec<T>,
        send_counts: &[usize],
        recv_counts: &[usize],
    ) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let mut out = Vec::new();
        self.engine.alltoall_flattened(
            self,
            &self.all_ranks(),
            values,
            send_counts,
            recv_counts,
            &mut out,
        )?;
        Ok(out)
    }
}
