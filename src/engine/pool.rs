//! Worker threads that run chunked transfer jobs.
//!
//! Jobs are split by direction into a send queue and a receive queue, each
//! served by its own workers, so receive jobs waiting on remote data can never
//! occupy every worker while local sends are still queued. A worker keeps one
//! block buffer for its whole life and runs one job at a time.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use flume::RecvTimeoutError;

use super::scheduler::{WorkItem, WorkOp};
use super::stream::{Framing, MessageLink};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::transport::ContextId;

/// How often a worker waiting for a reply checks that its scheduler still runs.
const DISCONNECT_POLL: Duration = Duration::from_millis(50);

/// Which queue a job goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Send,
    Receive,
}

/// The chunked serialize or deserialize work of one job.
pub(crate) type JobBody =
    Box<dyn FnOnce(&mut dyn MessageLink, Framing, &mut Vec<u8>) -> Result<()> + Send>;

/// Where a job's chunk messages go: the scheduler of its batch, plus the
/// context and tag every message of the batch uses.
#[derive(Clone)]
pub(crate) struct Route {
    pub(crate) work: flume::Sender<WorkItem>,
    pub(crate) ctx: ContextId,
    pub(crate) tag: i32,
}

/// One peer-to-peer transfer of a bulk operation.
pub(crate) struct ChunkedTransferJob {
    pub(crate) label: String,
    pub(crate) direction: Direction,
    pub(crate) peer: i32,
    pub(crate) route: Route,
    pub(crate) body: JobBody,
    pub(crate) on_complete: Box<dyn FnOnce(Result<()>) + Send>,
}

/// Chunk messages of a running job, handed to the scheduler one at a time.
struct WorkerLink<'a> {
    route: &'a Route,
    peer: i32,
    label: &'a Arc<str>,
}

impl WorkerLink<'_> {
    fn submit(&self, op: WorkOp) -> Result<crate::transport::Completion> {
        let (reply, done) = flume::bounded(1);
        let item = WorkItem {
            ctx: self.route.ctx,
            tag: self.route.tag,
            op,
            label: Arc::clone(self.label),
            reply,
        };
        self.route
            .work
            .send(item)
            .map_err(|_| Error::Disconnected(format!("{}: scheduler is gone", self.label)))?;
        loop {
            match done.recv_timeout(DISCONNECT_POLL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Disconnected(format!(
                        "{}: scheduler dropped the request",
                        self.label
                    )))
                }
                // An item still queued when the scheduler stopped is never answered
                Err(RecvTimeoutError::Timeout) if self.route.work.is_disconnected() => {
                    return Err(Error::Disconnected(format!("{}: scheduler is gone", self.label)))
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
}

impl MessageLink for WorkerLink<'_> {
    fn send_message(&mut self, data: Bytes) -> Result<()> {
        self.submit(WorkOp::Send {
            dest: self.peer,
            data,
        })
        .map(|_| ())
    }

    fn recv_message(&mut self, capacity: usize) -> Result<Bytes> {
        let completion = self.submit(WorkOp::Receive {
            source: self.peer,
            capacity,
        })?;
        Ok(completion.into_data())
    }
}

/// A fixed set of worker threads serving the send and receive queues.
pub(crate) struct WorkerPool {
    send_jobs: Option<flume::Sender<ChunkedTransferJob>>,
    receive_jobs: Option<flume::Sender<ChunkedTransferJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.workers` threads, split between the two queues.
    pub(crate) fn start(config: &EngineConfig) -> Result<Self> {
        let framing = Framing::new(config);
        let (send_tx, send_rx) = flume::unbounded();
        let (receive_tx, receive_rx) = flume::unbounded();
        let mut workers = Vec::with_capacity(config.workers);
        for (queue, count, jobs) in [
            ("send", config.send_workers(), send_rx),
            ("recv", config.receive_workers(), receive_rx),
        ] {
            for index in 0..count {
                let name = format!("ferrompi-serde-{queue}-{index}");
                let jobs = jobs.clone();
                let handle = thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || run_worker(&name, &jobs, framing))?;
                workers.push(handle);
            }
        }
        tracing::debug!(
            send_workers = config.send_workers(),
            receive_workers = config.receive_workers(),
            split = framing.split,
            block_size = framing.block_size,
            "worker pool started"
        );
        Ok(WorkerPool {
            send_jobs: Some(send_tx),
            receive_jobs: Some(receive_tx),
            workers,
        })
    }

    /// Queue a job. A job that cannot be queued completes with an error.
    pub(crate) fn submit(&self, job: ChunkedTransferJob) {
        let queue = match job.direction {
            Direction::Send => self.send_jobs.as_ref(),
            Direction::Receive => self.receive_jobs.as_ref(),
        };
        let rejected = match queue {
            Some(queue) => queue.send(job).err().map(|flume::SendError(job)| job),
            None => Some(job),
        };
        if let Some(job) = rejected {
            (job.on_complete)(Err(Error::Disconnected(format!(
                "{}: worker pool is shut down",
                job.label
            ))));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.send_jobs.take();
        self.receive_jobs.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("transfer worker panicked");
            }
        }
        tracing::debug!("worker pool stopped");
    }
}

fn run_worker(name: &str, jobs: &flume::Receiver<ChunkedTransferJob>, framing: Framing) {
    let mut buffer = Vec::new();
    while let Ok(job) = jobs.recv() {
        let ChunkedTransferJob {
            label,
            peer,
            route,
            body,
            on_complete,
            ..
        } = job;
        let label: Arc<str> = Arc::from(label);
        let mut link = WorkerLink {
            route: &route,
            peer,
            label: &label,
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| body(&mut link, framing, &mut buffer)))
            .unwrap_or_else(|_| Err(Error::Internal(format!("{label}: transfer job panicked"))));
        if let Err(err) = &result {
            tracing::debug!(worker = name, job = %label, error = %err, "transfer job failed");
        }
        on_complete(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scheduler::{BatchScheduler, BatchState};
    use crate::engine::stream::{read_value, write_value};
    use crate::transport::LocalTransport;

    fn small_config() -> EngineConfig {
        EngineConfig::default().with_workers(2).with_buffer_size(16)
    }

    #[test]
    fn jobs_run_through_the_scheduler() {
        // Rank 0 sends to itself
        let ranks = LocalTransport::group(1);
        let pool = WorkerPool::start(&small_config()).unwrap();
        let (work_tx, work_rx) = flume::unbounded();
        let state = Arc::new(BatchState::new(2));
        let route = Route {
            work: work_tx,
            ctx: ContextId(0),
            tag: 0,
        };
        let (value_tx, value_rx) = flume::bounded(1);

        let message = String::from("a string long enough to need several blocks");
        let send_state = Arc::clone(&state);
        pool.submit(ChunkedTransferJob {
            label: "send to 0".into(),
            direction: Direction::Send,
            peer: 0,
            route: route.clone(),
            body: Box::new(move |link, framing, buffer| {
                write_value(link, &message, framing, buffer).map(|_| ())
            }),
            on_complete: Box::new(move |result| send_state.finish_job(result)),
        });
        let receive_state = Arc::clone(&state);
        pool.submit(ChunkedTransferJob {
            label: "receive from 0".into(),
            direction: Direction::Receive,
            peer: 0,
            route,
            body: Box::new(move |link, framing, buffer| {
                let (value, _) = read_value::<String, _>(link, framing, buffer)?;
                value_tx
                    .send(value)
                    .map_err(|_| Error::Internal("result dropped".into()))
            }),
            on_complete: Box::new(move |result| receive_state.finish_job(result)),
        });

        BatchScheduler::new(&*ranks[0], work_rx, state, "loop", Duration::from_secs(60))
            .run()
            .unwrap_or_else(|err| panic!("batch failed: {err}"));
        assert_eq!(value_rx.recv().unwrap(), "a string long enough to need several blocks");
        assert_eq!(ranks[0].undelivered(), 0);
    }

    #[test]
    fn panicking_job_reports_an_error() {
        let pool = WorkerPool::start(&small_config()).unwrap();
        let (work_tx, _work_rx) = flume::unbounded();
        let (result_tx, result_rx) = flume::bounded(1);
        pool.submit(ChunkedTransferJob {
            label: "doomed".into(),
            direction: Direction::Receive,
            peer: 0,
            route: Route {
                work: work_tx,
                ctx: ContextId(0),
                tag: 0,
            },
            body: Box::new(|_, _, _| panic!("boom")),
            on_complete: Box::new(move |result| {
                let _ = result_tx.send(result);
            }),
        });
        assert!(matches!(result_rx.recv().unwrap(), Err(Error::Internal(_))));
    }

    #[test]
    fn job_fails_when_its_scheduler_is_gone() {
        let pool = WorkerPool::start(&small_config()).unwrap();
        let (work_tx, work_rx) = flume::unbounded();
        // Keep the item queued but never answered, then stop listening
        drop(work_rx);
        let (result_tx, result_rx) = flume::bounded(1);
        pool.submit(ChunkedTransferJob {
            label: "orphan".into(),
            direction: Direction::Send,
            peer: 0,
            route: Route {
                work: work_tx,
                ctx: ContextId(0),
                tag: 0,
            },
            body: Box::new(|link, _, _| link.send_message(Bytes::from_static(b"x"))),
            on_complete: Box::new(move |result| {
                let _ = result_tx.send(result);
            }),
        });
        assert!(matches!(result_rx.recv().unwrap(), Err(Error::Disconnected(_))));
    }

    #[test]
    fn dropping_the_pool_joins_workers() {
        let pool = WorkerPool::start(&small_config()).unwrap();
        assert_eq!(pool.workers.len(), 2);
        drop(pool);
    }
}
