//! Transfers of serialized values of any size.
//!
//! Point-to-point transfers ([`LargeObjectEngine::send_large`] and
//! [`LargeObjectEngine::receive_large`]) run on the calling thread and talk
//! to the transport directly. Bulk operations (gather, scatter, all-to-all)
//! turn every peer-to-peer transfer into a [`ChunkedTransferJob`] for the
//! worker pool and drive all of them from one [`BatchScheduler`] on the
//! calling thread, so the transfers of a batch progress together instead of
//! one after another.
//!
//! Values travel as chunk streams (see the `stream` module). With
//! `split_large_objects` disabled a value is one chunk; otherwise it is cut
//! into `buffer_size` blocks as it is encoded, and neither side holds more
//! than one block of it at a time.
//!
//! Point-to-point transfers use the communicator's primary channel and the
//! caller's tag. Bulk transfers use the shadow channel and [`COLLECTIVE_TAG`].

mod pool;
mod scheduler;
mod stream;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use self::pool::{ChunkedTransferJob, Direction, JobBody, Route, WorkerPool};
use self::scheduler::{BatchScheduler, BatchState};
use self::stream::{read_value, write_value, DirectLink, Framing};
use crate::comm::Communicator;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::status::Status;
use crate::tag::COLLECTIVE_TAG;

/// Block buffers kept around between transfers on the calling thread.
const MAX_IDLE_SCRATCH: usize = 4;

/// Moves serialized values in chunks, with a worker pool for bulk operations.
///
/// Every [`Communicator`] holds one engine; duplicates of a communicator
/// share it. The worker pool is started by the first bulk operation and
/// stopped when the last communicator using the engine is dropped.
pub struct LargeObjectEngine {
    config: EngineConfig,
    framing: Framing,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    scratch: Mutex<Vec<Vec<u8>>>,
}

impl std::fmt::Debug for LargeObjectEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LargeObjectEngine")
            .field("config", &self.config)
            .field("pool_started", &self.pool.lock().is_some())
            .finish()
    }
}

/// A job before it is routed to a batch.
struct PlannedJob {
    direction: Direction,
    peer: i32,
    body: JobBody,
}

/// Received values of a bulk operation, by participant index.
type Slots<T> = Arc<Mutex<Vec<Option<T>>>>;

impl LargeObjectEngine {
    /// Create an engine. Fails if the configuration does not validate.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(LargeObjectEngine {
            framing: Framing::new(&config),
            config,
            pool: Mutex::new(None),
            scratch: Mutex::new(Vec::new()),
        })
    }

    /// The configuration this engine runs with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn pool(&self) -> Result<Arc<WorkerPool>> {
        let mut pool = self.pool.lock();
        if let Some(pool) = pool.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let started = Arc::new(WorkerPool::start(&self.config)?);
        *pool = Some(Arc::clone(&started));
        Ok(started)
    }

    fn with_scratch<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let mut scratch = self.scratch.lock().pop().unwrap_or_default();
        let result = f(&mut scratch);
        let mut idle = self.scratch.lock();
        if idle.len() < MAX_IDLE_SCRATCH {
            idle.push(scratch);
        }
        result
    }

    /// Send `value` to `dest`, blocking until every chunk has been handed to
    /// the transport.
    pub fn send_large<T: Serialize + ?Sized>(
        &self,
        comm: &Communicator,
        value: &T,
        dest: i32,
        tag: i32,
    ) -> Result<()> {
        let transport = comm.transport();
        let mut link = DirectLink::new(transport.as_ref(), comm.primary(), dest, tag);
        let bytes =
            self.with_scratch(|scratch| write_value(&mut link, value, self.framing, scratch))?;
        tracing::trace!(dest, tag, bytes, "large value sent");
        Ok(())
    }

    /// Receive a value sent with [`send_large`](Self::send_large).
    ///
    /// `source` and `tag` may be wildcards; once the first chunk has matched,
    /// the rest of the value is taken from the same sender and tag. The
    /// status count is the encoded size in bytes.
    pub fn receive_large<T: DeserializeOwned>(
        &self,
        comm: &Communicator,
        source: i32,
        tag: i32,
    ) -> Result<(T, Status)> {
        let transport = comm.transport();
        let mut link = DirectLink::new(transport.as_ref(), comm.primary(), source, tag);
        let (value, bytes) =
            self.with_scratch(|scratch| read_value::<T, _>(&mut link, self.framing, scratch))?;
        Ok((value, link.status(bytes)))
    }

    /// Gather one value from every participant at `root`.
    ///
    /// `ranks` lists the participating ranks; every participant passes the
    /// same list. At the root, `out` is cleared and refilled with one value
    /// per participant in `ranks` order; elsewhere it is left untouched.
    pub fn gather_large<T>(
        &self,
        comm: &Communicator,
        ranks: &[i32],
        value: T,
        root: i32,
        out: &mut Vec<T>,
    ) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let me = position(comm, ranks)?;
        let root_index = root_position(ranks, root)?;
        let transport = comm.transport();

        if me != root_index {
            let mut link = DirectLink::new(transport.as_ref(), comm.shadow(), root, COLLECTIVE_TAG);
            self.with_scratch(|scratch| write_value(&mut link, &value, self.framing, scratch))?;
            return Ok(());
        }

        let slots: Slots<T> = Arc::new(Mutex::new(empty_slots(ranks.len())));
        slots.lock()[me] = Some(value);
        let jobs = rotated(me, ranks.len())
            .map(|(_, from)| receive_job(ranks[from], from, &slots))
            .collect();
        self.run_batch(comm, "gather", jobs)?;
        collect_slots(&slots, out)
    }

    /// Hand `values[i]` to participant `ranks[i]`, returning this rank's value.
    ///
    /// Only the root's `values` are read; they must hold one value per
    /// participant. Other ranks may pass an empty vector.
    pub fn scatter_large<T>(
        &self,
        comm: &Communicator,
        ranks: &[i32],
        values: Vec<T>,
        root: i32,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let me = position(comm, ranks)?;
        let root_index = root_position(ranks, root)?;
        let transport = comm.transport();

        if me != root_index {
            let mut link = DirectLink::new(transport.as_ref(), comm.shadow(), root, COLLECTIVE_TAG);
            let (value, _) =
                self.with_scratch(|scratch| read_value::<T, _>(&mut link, self.framing, scratch))?;
            return Ok(value);
        }

        let mut values = into_slots(values, ranks.len())?;
        let own = take_slot(&mut values, me)?;
        let mut jobs = Vec::with_capacity(ranks.len() - 1);
        for (to, _) in rotated(me, ranks.len()) {
            let value = take_slot(&mut values, to)?;
            jobs.push(send_job(ranks[to], value));
        }
        self.run_batch(comm, "scatter", jobs)?;
        Ok(own)
    }

    /// Send `values[i]` to participant `ranks[i]` and receive one value from
    /// every participant into `out`, in `ranks` order.
    ///
    /// The value a rank addresses to itself is moved into `out` directly.
    pub fn alltoall<T>(
        &self,
        comm: &Communicator,
        ranks: &[i32],
        values: Vec<T>,
        out: &mut Vec<T>,
    ) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let me = position(comm, ranks)?;
        let mut values = into_slots(values, ranks.len())?;
        let slots: Slots<T> = Arc::new(Mutex::new(empty_slots(ranks.len())));
        slots.lock()[me] = Some(take_slot(&mut values, me)?);

        let mut jobs = Vec::with_capacity(2 * (ranks.len() - 1));
        for (to, from) in rotated(me, ranks.len()) {
            let value = take_slot(&mut values, to)?;
            jobs.push(send_job(ranks[to], value));
            jobs.push(receive_job(ranks[from], from, &slots));
        }
        self.run_batch(comm, "alltoall", jobs)?;
        collect_slots(&slots, out)
    }

    /// All-to-all over one flat array per rank.
    ///
    /// `values` is split into consecutive blocks of `send_counts[i]` elements,
    /// block `i` going to `ranks[i]`. The block received from `ranks[i]` must
    /// hold exactly `recv_counts[i]` elements; the received blocks are
    /// concatenated into `out`.
    pub fn alltoall_flattened<T>(
        &self,
        comm: &Communicator,
        ranks: &[i32],
        values: Vec<T>,
        send_counts: &[usize],
        recv_counts: &[usize],
        out: &mut Vec<T>,
    ) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        for counts in [send_counts, recv_counts] {
            if counts.len() != ranks.len() {
                return Err(Error::InvalidCount(counts.len() as i64));
            }
        }
        let total: usize = send_counts.iter().sum();
        if total != values.len() {
            return Err(Error::InvalidCount(values.len() as i64));
        }

        let mut rest = values.into_iter();
        let blocks: Vec<Vec<T>> = send_counts
            .iter()
            .map(|&count| rest.by_ref().take(count).collect())
            .collect();
        let mut received = Vec::with_capacity(ranks.len());
        self.alltoall(comm, ranks, blocks, &mut received)?;

        for ((block, &expected), &rank) in received.iter().zip(recv_counts).zip(ranks) {
            if block.len() > expected {
                return Err(Error::Overflow {
                    received: block.len(),
                    capacity: expected,
                });
            }
            if block.len() < expected {
                return Err(Error::Protocol(format!(
                    "rank {rank} sent {} elements, expected {expected}",
                    block.len()
                )));
            }
        }
        out.clear();
        out.reserve(recv_counts.iter().sum());
        for block in received {
            out.extend(block);
        }
        Ok(())
    }

    /// Run `jobs` on the worker pool, driven by a scheduler on this thread.
    fn run_batch(
        &self,
        comm: &Communicator,
        name: &'static str,
        jobs: Vec<PlannedJob>,
    ) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let pool = self.pool()?;
        let (work_tx, work_rx) = flume::unbounded();
        let state = Arc::new(BatchState::new(jobs.len()));
        let route = Route {
            work: work_tx,
            ctx: comm.shadow(),
            tag: COLLECTIVE_TAG,
        };
        tracing::debug!(
            batch = name,
            rank = comm.rank(),
            jobs = jobs.len(),
            "starting batch"
        );
        for job in jobs {
            let label = match job.direction {
                Direction::Send => format!("{name}: send to {}", job.peer),
                Direction::Receive => format!("{name}: receive from {}", job.peer),
            };
            let state = Arc::clone(&state);
            pool.submit(ChunkedTransferJob {
                label,
                direction: job.direction,
                peer: job.peer,
                route: route.clone(),
                body: job.body,
                on_complete: Box::new(move |result| state.finish_job(result)),
            });
        }
        drop(route);

        let transport = comm.transport();
        BatchScheduler::new(
            transport.as_ref(),
            work_rx,
            state,
            name,
            self.config.stale_report_interval,
        )
        .run()
    }
}

/// Index of the calling rank in `ranks`, checking the list for duplicates.
fn position(comm: &Communicator, ranks: &[i32]) -> Result<usize> {
    let mut seen = HashSet::with_capacity(ranks.len());
    for &rank in ranks {
        if rank < 0 || rank >= comm.size() || !seen.insert(rank) {
            return Err(Error::InvalidRank(rank));
        }
    }
    let me = comm.rank();
    ranks
        .iter()
        .position(|&rank| rank == me)
        .ok_or(Error::InvalidRank(me))
}

fn root_position(ranks: &[i32], root: i32) -> Result<usize> {
    ranks
        .iter()
        .position(|&rank| rank == root)
        .ok_or(Error::InvalidRank(root))
}

/// Pairwise exchange order: in step `k` send to `me + k`, receive from `me - k`.
///
/// Yields `(to, from)` participant indices for `k` in `1..n`.
fn rotated(me: usize, n: usize) -> impl Iterator<Item = (usize, usize)> {
    (1..n).map(move |k| ((me + k) % n, (me + n - k) % n))
}

fn empty_slots<T>(n: usize) -> Vec<Option<T>> {
    std::iter::repeat_with(|| None).take(n).collect()
}

fn into_slots<T>(values: Vec<T>, n: usize) -> Result<Vec<Option<T>>> {
    if values.len() != n {
        return Err(Error::InvalidCount(values.len() as i64));
    }
    Ok(values.into_iter().map(Some).collect())
}

fn take_slot<T>(slots: &mut [Option<T>], index: usize) -> Result<T> {
    slots[index]
        .take()
        .ok_or_else(|| Error::Internal(format!("slot {index} used twice")))
}

fn collect_slots<T>(slots: &Slots<T>, out: &mut Vec<T>) -> Result<()> {
    let mut slots = slots.lock();
    out.clear();
    out.reserve(slots.len());
    for (index, slot) in slots.iter_mut().enumerate() {
        let value = slot
            .take()
            .ok_or_else(|| Error::Internal(format!("no value arrived for slot {index}")))?;
        out.push(value);
    }
    Ok(())
}

fn send_job<T>(peer: i32, value: T) -> PlannedJob
where
    T: Serialize + Send + 'static,
{
    PlannedJob {
        direction: Direction::Send,
        peer,
        body: Box::new(move |link, framing, buffer| {
            write_value(link, &value, framing, buffer).map(|_| ())
        }),
    }
}

fn receive_job<T>(peer: i32, index: usize, slots: &Slots<T>) -> PlannedJob
where
    T: DeserializeOwned + Send + 'static,
{
    let slots = Arc::clone(slots);
    PlannedJob {
        direction: Direction::Receive,
        peer,
        body: Box::new(move |link, framing, buffer| {
            let (value, _) = read_value::<T, _>(link, framing, buffer)?;
            slots.lock()[index] = Some(value);
            Ok(())
        }),
    }
}
