//! The loop that issues and polls native requests for a bulk operation.
//!
//! Worker threads never call the transport. Each chunk message they need is
//! sent to the batch's [`BatchScheduler`] as a [`WorkItem`] carrying a one-shot
//! reply channel; the scheduler turns the item into a nonblocking native
//! request, polls all live requests with `test_any`, and answers the worker
//! when its request completes. The scheduler runs on the thread that called
//! the bulk operation and returns once every job of the batch has reported.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::RecvTimeoutError;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::transport::{Completion, ContextId, RawRequest, Transport};

/// How long an idle scheduler parks on its work queue before rechecking.
const IDLE_WAIT: Duration = Duration::from_millis(2);

/// One native operation requested by a worker.
pub(crate) struct WorkItem {
    pub(crate) ctx: ContextId,
    pub(crate) tag: i32,
    pub(crate) op: WorkOp,
    pub(crate) label: Arc<str>,
    pub(crate) reply: flume::Sender<Result<Completion>>,
}

pub(crate) enum WorkOp {
    Send { dest: i32, data: Bytes },
    Receive { source: i32, capacity: usize },
}

/// Shared progress of the jobs of one batch.
#[derive(Debug)]
pub(crate) struct BatchState {
    pending: AtomicUsize,
    failure: Mutex<Option<Error>>,
}

impl BatchState {
    pub(crate) fn new(jobs: usize) -> Self {
        BatchState {
            pending: AtomicUsize::new(jobs),
            failure: Mutex::new(None),
        }
    }

    /// Record the end of one job. Only the first failure is kept.
    pub(crate) fn finish_job(&self, result: Result<()>) {
        if let Err(err) = result {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn take_failure(&self) -> Option<Error> {
        self.failure.lock().take()
    }
}

struct LiveRequest {
    handle: RawRequest,
    reply: flume::Sender<Result<Completion>>,
    label: Arc<str>,
}

/// Drives the native requests of one bulk operation to completion.
pub(crate) struct BatchScheduler<'t> {
    transport: &'t dyn Transport,
    work: flume::Receiver<WorkItem>,
    state: Arc<BatchState>,
    live: Vec<LiveRequest>,
    name: &'static str,
    stale_interval: Duration,
}

impl<'t> BatchScheduler<'t> {
    pub(crate) fn new(
        transport: &'t dyn Transport,
        work: flume::Receiver<WorkItem>,
        state: Arc<BatchState>,
        name: &'static str,
        stale_interval: Duration,
    ) -> Self {
        BatchScheduler {
            transport,
            work,
            state,
            live: Vec::new(),
            name,
            stale_interval,
        }
    }

    /// Run until every job has finished.
    ///
    /// On the first failure the live native requests are cancelled and the
    /// error is returned; jobs still running see their link disconnect.
    pub(crate) fn run(mut self) -> Result<()> {
        let started = Instant::now();
        let mut last_report = started;
        let mut issued = 0usize;
        loop {
            if let Some(err) = self.state.take_failure() {
                self.abort();
                return Err(err);
            }

            let mut progressed = false;
            while let Ok(item) = self.work.try_recv() {
                self.issue(item);
                issued += 1;
                progressed = true;
            }

            if !self.live.is_empty() {
                let handles: Vec<RawRequest> = self.live.iter().map(|live| live.handle).collect();
                match self.transport.test_any(&handles) {
                    Ok(Some((index, completion))) => {
                        let live = self.live.swap_remove(index);
                        // The worker may have given up already
                        let _ = live.reply.send(Ok(completion));
                        progressed = true;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        self.abort();
                        return Err(err);
                    }
                }
            }

            if self.state.pending() == 0 && self.live.is_empty() && self.work.is_empty() {
                tracing::debug!(
                    batch = self.name,
                    requests = issued,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "batch drained"
                );
                return match self.state.take_failure() {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }

            if last_report.elapsed() >= self.stale_interval {
                self.report_stale(started.elapsed());
                last_report = Instant::now();
            }

            if !progressed {
                if self.live.is_empty() {
                    match self.work.recv_timeout(IDLE_WAIT) {
                        Ok(item) => {
                            self.issue(item);
                            issued += 1;
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => thread::yield_now(),
                    }
                } else {
                    thread::yield_now();
                }
            }
        }
    }

    fn issue(&mut self, item: WorkItem) {
        let WorkItem {
            ctx,
            tag,
            op,
            label,
            reply,
        } = item;
        let started = match op {
            WorkOp::Send { dest, data } => {
                tracing::trace!(job = %label, dest, tag, bytes = data.len(), "issuing send");
                self.transport.isend(ctx, dest, tag, data)
            }
            WorkOp::Receive { source, capacity } => {
                tracing::trace!(job = %label, source, tag, capacity, "issuing receive");
                self.transport.irecv(ctx, source, tag, Some(capacity))
            }
        };
        match started {
            Ok(handle) => self.live.push(LiveRequest {
                handle,
                reply,
                label,
            }),
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    fn abort(&mut self) {
        tracing::debug!(batch = self.name, live = self.live.len(), "aborting batch");
        for live in self.live.drain(..) {
            if self.transport.cancel(live.handle).is_ok() {
                let _ = self.transport.test(live.handle);
            }
            let _ = live.reply.send(Err(Error::Disconnected(format!(
                "{}: batch aborted",
                live.label
            ))));
        }
        while let Ok(item) = self.work.try_recv() {
            let _ = item.reply.send(Err(Error::Disconnected(format!(
                "{}: batch aborted",
                item.label
            ))));
        }
    }

    fn report_stale(&self, elapsed: Duration) {
        let outstanding: Vec<&str> = self.live.iter().map(|live| &*live.label).collect();
        tracing::warn!(
            batch = self.name,
            elapsed_secs = elapsed.as_secs(),
            pending_jobs = self.state.pending(),
            outstanding = ?outstanding,
            "bulk transfer still draining"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;

    const CTX: ContextId = ContextId(0);

    fn item(op: WorkOp) -> (WorkItem, flume::Receiver<Result<Completion>>) {
        let (reply, done) = flume::bounded(1);
        (
            WorkItem {
                ctx: CTX,
                tag: 0,
                op,
                label: Arc::from("test job"),
                reply,
            },
            done,
        )
    }

    #[test]
    fn batch_state_keeps_first_failure() {
        let state = BatchState::new(3);
        state.finish_job(Ok(()));
        state.finish_job(Err(Error::Protocol("first".into())));
        state.finish_job(Err(Error::Protocol("second".into())));
        assert_eq!(state.pending(), 0);
        match state.take_failure() {
            Some(Error::Protocol(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[test]
    fn empty_batch_returns_immediately() {
        let ranks = LocalTransport::group(1);
        let (_tx, rx) = flume::unbounded();
        let state = Arc::new(BatchState::new(0));
        let scheduler = BatchScheduler::new(&*ranks[0], rx, state, "empty", Duration::from_secs(60));
        scheduler.run().unwrap();
    }

    #[test]
    fn issues_items_and_answers_workers() {
        let ranks = LocalTransport::group(2);
        let (work_tx, work_rx) = flume::unbounded();
        let state = Arc::new(BatchState::new(1));

        let job_state = Arc::clone(&state);
        let worker = thread::spawn(move || {
            let (send, sent) = item(WorkOp::Send {
                dest: 1,
                data: Bytes::from_static(b"ping"),
            });
            work_tx.send(send).unwrap();
            let completion = sent.recv().unwrap().unwrap();
            assert_eq!(completion.len, 4);
            job_state.finish_job(Ok(()));
        });

        BatchScheduler::new(&*ranks[0], work_rx, state, "ping", Duration::from_secs(60))
            .run()
            .unwrap();
        worker.join().unwrap();
        assert_eq!(ranks[0].stats().isends, 1);
        let received = ranks[1].recv(CTX, 0, 0, None).unwrap();
        assert_eq!(&received.into_data()[..], b"ping");
    }

    #[test]
    fn job_failure_aborts_live_requests() {
        let ranks = LocalTransport::group(2);
        let (work_tx, work_rx) = flume::unbounded();
        let state = Arc::new(BatchState::new(2));

        // A receive nobody will ever satisfy
        let (receive, received) = item(WorkOp::Receive {
            source: 1,
            capacity: 8,
        });
        work_tx.send(receive).unwrap();

        let job_state = Arc::clone(&state);
        let failing = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            job_state.finish_job(Err(Error::Serialization("bad value".into())));
        });

        let err = BatchScheduler::new(&*ranks[0], work_rx, state, "abort", Duration::from_secs(60))
            .run()
            .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)), "got: {err}");
        failing.join().unwrap();
        assert!(matches!(received.recv().unwrap(), Err(Error::Disconnected(_))));
        assert_eq!(ranks[0].stats().cancels, 1);
    }

    #[test]
    fn native_failure_is_returned_to_the_worker() {
        let ranks = LocalTransport::group(1);
        let (work_tx, work_rx) = flume::unbounded();
        let state = Arc::new(BatchState::new(1));
        let (send, sent) = item(WorkOp::Send {
            dest: 5,
            data: Bytes::new(),
        });
        work_tx.send(send).unwrap();

        let job_state = Arc::clone(&state);
        let worker = thread::spawn(move || {
            let result = sent.recv().unwrap().map(|_| ());
            assert!(result.is_err());
            job_state.finish_job(result);
        });
        let err = BatchScheduler::new(&*ranks[0], work_rx, state, "bad rank", Duration::from_secs(60))
            .run()
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }), "got: {err}");
        worker.join().unwrap();
    }
}
