//! In-process transport simulating a group of ranks.
//!
//! All ranks of a group share one mailbox. Receives are matched in posting
//! order against messages in arrival order, so messages between the same pair
//! of ranks on the same context and tag never overtake each other.
//!
//! Sends are buffered: the message is visible to receivers as soon as the send
//! starts, and the send request completes immediately. A rank can switch to
//! held sends with [`LocalTransport::hold_sends`]; held send requests stay
//! pending until [`LocalTransport::release_sends`], which lets tests pick the
//! order in which the legs of a transfer complete.
//!
//! # Example
//!
//! ```
//! use ferrompi_serde::transport::{ContextId, Transport};
//! use ferrompi_serde::LocalTransport;
//!
//! let ranks = LocalTransport::group(2);
//! ranks[0].send(ContextId::WORLD, 1, 5, b"hello").unwrap();
//! let completion = ranks[1].recv(ContextId::WORLD, 0, 5, None).unwrap();
//! assert_eq!(&completion.into_data()[..], b"hello");
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use super::{Completion, ContextId, RawRequest, Transport, ANY_SOURCE, ANY_TAG};
use crate::error::{Error, ErrorClass, Result};
use crate::status::Status;

/// Call counters for one rank of a [`LocalTransport`] group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Blocking sends.
    pub sends: usize,
    /// Blocking receives.
    pub recvs: usize,
    /// Nonblocking sends started.
    pub isends: usize,
    /// Nonblocking receives posted.
    pub irecvs: usize,
    /// `wait` calls.
    pub waits: usize,
    /// `test` calls.
    pub tests: usize,
    /// `cancel` calls.
    pub cancels: usize,
    messages: HashMap<ContextId, usize>,
}

impl TransportStats {
    /// Messages this rank sent on `ctx`.
    pub fn messages_on(&self, ctx: ContextId) -> usize {
        self.messages.get(&ctx).copied().unwrap_or(0)
    }

    /// Messages this rank sent on any context.
    pub fn messages(&self) -> usize {
        self.messages.values().sum()
    }

    /// Native calls of any kind.
    pub fn native_calls(&self) -> usize {
        self.sends + self.recvs + self.isends + self.irecvs + self.waits + self.tests + self.cancels
    }
}

/// One rank of an in-process group.
pub struct LocalTransport {
    rank: i32,
    group: Arc<Group>,
}

struct Group {
    size: i32,
    mailbox: Mutex<Mailbox>,
    changed: Condvar,
}

struct Envelope {
    ctx: ContextId,
    source: i32,
    dest: i32,
    tag: i32,
    data: Bytes,
    send_request: Option<u64>,
}

struct PostedReceive {
    request: u64,
    owner: i32,
    ctx: ContextId,
    source: i32,
    tag: i32,
    capacity: Option<usize>,
}

impl PostedReceive {
    fn matches(&self, message: &Envelope) -> bool {
        message.ctx == self.ctx
            && message.dest == self.owner
            && (self.source == ANY_SOURCE || self.source == message.source)
            && (self.tag == ANY_TAG || self.tag == message.tag)
    }
}

enum Outcome {
    Done(Completion),
    Failed(ErrorClass, String),
}

enum Slot {
    HeldSend {
        owner: i32,
        ctx: ContextId,
        completion: Completion,
    },
    Receive {
        owner: i32,
    },
    Ready {
        owner: i32,
        outcome: Outcome,
    },
}

impl Slot {
    fn owner(&self) -> i32 {
        match self {
            Slot::HeldSend { owner, .. } | Slot::Receive { owner } | Slot::Ready { owner, .. } => {
                *owner
            }
        }
    }
}

struct Mailbox {
    next_request: u64,
    next_context: u32,
    messages: VecDeque<Envelope>,
    posted: Vec<PostedReceive>,
    slots: HashMap<u64, Slot>,
    holding: HashSet<i32>,
    contexts: HashMap<(ContextId, u32), ContextId>,
    duplicates: HashMap<(i32, ContextId), u32>,
    stats: Vec<TransportStats>,
}

impl Mailbox {
    fn new(size: usize) -> Self {
        Mailbox {
            next_request: 1,
            next_context: 0,
            messages: VecDeque::new(),
            posted: Vec::new(),
            slots: HashMap::new(),
            holding: HashSet::new(),
            contexts: HashMap::new(),
            duplicates: HashMap::new(),
            stats: vec![TransportStats::default(); size],
        }
    }

    fn stats(&mut self, rank: i32) -> &mut TransportStats {
        &mut self.stats[rank as usize]
    }

    fn next_request(&mut self) -> u64 {
        let id = self.next_request;
        self.next_request += 1;
        id
    }

    fn deposit(&mut self, message: Envelope) {
        *self.stats(message.source).messages.entry(message.ctx).or_insert(0) += 1;
        self.messages.push_back(message);
    }

    /// Match posted receives against queued messages. Returns true if anything matched.
    fn progress(&mut self) -> bool {
        let mut matched = false;
        let mut i = 0;
        while i < self.posted.len() {
            let position = self.messages.iter().position(|m| self.posted[i].matches(m));
            let Some(position) = position else {
                i += 1;
                continue;
            };
            let posted = self.posted.remove(i);
            let Some(message) = self.messages.remove(position) else {
                continue;
            };
            let outcome = match posted.capacity {
                Some(capacity) if message.data.len() > capacity => Outcome::Failed(
                    ErrorClass::Truncate,
                    format!(
                        "message of {} bytes from rank {} tag {} exceeds receive capacity {}",
                        message.data.len(),
                        message.source,
                        message.tag,
                        capacity
                    ),
                ),
                _ => Outcome::Done(Completion {
                    source: message.source,
                    tag: message.tag,
                    len: message.data.len(),
                    cancelled: false,
                    data: Some(message.data),
                }),
            };
            self.slots.insert(
                posted.request,
                Slot::Ready {
                    owner: posted.owner,
                    outcome,
                },
            );
            matched = true;
        }
        matched
    }

    /// Remove and return the outcome of a finished request owned by `rank`.
    fn take_ready(&mut self, rank: i32, request: RawRequest) -> Result<Option<Outcome>> {
        let ready = match self.slots.get(&request.0) {
            None => {
                return Err(Error::transport(
                    ErrorClass::Request,
                    format!("unknown request handle {}", request.0),
                ))
            }
            Some(slot) if slot.owner() != rank => {
                return Err(Error::transport(
                    ErrorClass::Request,
                    format!("request {} belongs to rank {}", request.0, slot.owner()),
                ))
            }
            Some(slot) => matches!(slot, Slot::Ready { .. }),
        };
        if !ready {
            return Ok(None);
        }
        match self.slots.remove(&request.0) {
            Some(Slot::Ready { outcome, .. }) => Ok(Some(outcome)),
            _ => Ok(None),
        }
    }

    /// Withdraw a request that has not taken effect yet.
    fn cancel(&mut self, rank: i32, request: RawRequest) -> Result<()> {
        enum Pending {
            Receive,
            Send(i32),
            Finished,
        }
        let pending = match self.slots.get(&request.0) {
            None => {
                return Err(Error::transport(
                    ErrorClass::Request,
                    format!("unknown request handle {}", request.0),
                ))
            }
            Some(slot) if slot.owner() != rank => {
                return Err(Error::transport(
                    ErrorClass::Request,
                    format!("request {} belongs to rank {}", request.0, slot.owner()),
                ))
            }
            Some(Slot::Receive { .. }) => Pending::Receive,
            Some(Slot::HeldSend { completion, .. }) => Pending::Send(completion.tag),
            Some(Slot::Ready { .. }) => Pending::Finished,
        };
        let cancelled = match pending {
            Pending::Receive => self
                .posted
                .iter()
                .position(|p| p.request == request.0)
                .map(|index| {
                    let posted = self.posted.remove(index);
                    (posted.source, posted.tag)
                }),
            // Only a send whose message nobody has matched yet can be withdrawn
            Pending::Send(tag) => self
                .messages
                .iter()
                .position(|m| m.send_request == Some(request.0))
                .map(|index| {
                    self.messages.remove(index);
                    (rank, tag)
                }),
            Pending::Finished => None,
        };
        if let Some((source, tag)) = cancelled {
            self.slots.insert(
                request.0,
                Slot::Ready {
                    owner: rank,
                    outcome: Outcome::Done(Completion {
                        source,
                        tag,
                        len: 0,
                        cancelled: true,
                        data: None,
                    }),
                },
            );
        }
        Ok(())
    }

    fn find_message(&self, rank: i32, ctx: ContextId, source: i32, tag: i32) -> Option<Status> {
        self.messages
            .iter()
            .find(|m| {
                m.ctx == ctx
                    && m.dest == rank
                    && (source == ANY_SOURCE || source == m.source)
                    && (tag == ANY_TAG || tag == m.tag)
            })
            .map(|m| Status::new(m.source, m.tag, m.data.len() as i64))
    }
}

impl Outcome {
    fn into_result(self) -> Result<Completion> {
        match self {
            Outcome::Done(completion) => Ok(completion),
            Outcome::Failed(class, message) => Err(Error::transport(class, message)),
        }
    }
}

impl LocalTransport {
    /// Create a group of `size` ranks sharing one mailbox.
    pub fn group(size: usize) -> Vec<Arc<LocalTransport>> {
        let group = Arc::new(Group {
            size: size as i32,
            mailbox: Mutex::new(Mailbox::new(size)),
            changed: Condvar::new(),
        });
        (0..size as i32)
            .map(|rank| {
                Arc::new(LocalTransport {
                    rank,
                    group: Arc::clone(&group),
                })
            })
            .collect()
    }

    /// Keep this rank's subsequent send requests pending until released.
    pub fn hold_sends(&self, hold: bool) {
        let mut mailbox = self.group.mailbox.lock();
        if hold {
            mailbox.holding.insert(self.rank);
        } else {
            mailbox.holding.remove(&self.rank);
        }
    }

    /// Complete this rank's held send requests, on `ctx` only if given.
    ///
    /// Returns how many requests were released.
    pub fn release_sends(&self, ctx: Option<ContextId>) -> usize {
        let mut mailbox = self.group.mailbox.lock();
        let ids: Vec<u64> = mailbox
            .slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::HeldSend { owner, ctx: c, .. }
                    if *owner == self.rank && ctx.map_or(true, |ctx| ctx == *c) =>
                {
                    Some(*id)
                }
                _ => None,
            })
            .collect();
        for id in &ids {
            if let Some(Slot::HeldSend {
                owner, completion, ..
            }) = mailbox.slots.remove(id)
            {
                mailbox.slots.insert(
                    *id,
                    Slot::Ready {
                        owner,
                        outcome: Outcome::Done(completion),
                    },
                );
            }
        }
        self.group.changed.notify_all();
        ids.len()
    }

    /// Snapshot of this rank's call counters.
    pub fn stats(&self) -> TransportStats {
        self.group.mailbox.lock().stats[self.rank as usize].clone()
    }

    /// Messages sent by any rank that no receive has consumed yet.
    pub fn undelivered(&self) -> usize {
        self.group.mailbox.lock().messages.len()
    }

    fn check_dest(&self, dest: i32, tag: i32) -> Result<()> {
        if dest < 0 || dest >= self.group.size {
            return Err(Error::transport(
                ErrorClass::Rank,
                format!("destination rank {dest} outside group of {}", self.group.size),
            ));
        }
        if tag < 0 {
            return Err(Error::transport(
                ErrorClass::Tag,
                format!("send tag {tag} is negative"),
            ));
        }
        Ok(())
    }

    fn check_source(&self, source: i32, tag: i32) -> Result<()> {
        if source != ANY_SOURCE && (source < 0 || source >= self.group.size) {
            return Err(Error::transport(
                ErrorClass::Rank,
                format!("source rank {source} outside group of {}", self.group.size),
            ));
        }
        if tag != ANY_TAG && tag < 0 {
            return Err(Error::transport(
                ErrorClass::Tag,
                format!("receive tag {tag} is invalid"),
            ));
        }
        Ok(())
    }

    fn post_receive(
        &self,
        mailbox: &mut Mailbox,
        ctx: ContextId,
        source: i32,
        tag: i32,
        capacity: Option<usize>,
    ) -> RawRequest {
        let id = mailbox.next_request();
        mailbox.posted.push(PostedReceive {
            request: id,
            owner: self.rank,
            ctx,
            source,
            tag,
            capacity,
        });
        mailbox.slots.insert(id, Slot::Receive { owner: self.rank });
        RawRequest(id)
    }

    fn wait_locked(
        &self,
        mailbox: &mut parking_lot::MutexGuard<'_, Mailbox>,
        request: RawRequest,
    ) -> Result<Completion> {
        loop {
            if mailbox.progress() {
                self.group.changed.notify_all();
            }
            if let Some(outcome) = mailbox.take_ready(self.rank, request)? {
                return outcome.into_result();
            }
            self.group.changed.wait(mailbox);
        }
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.group.size
    }

    fn duplicate(&self, ctx: ContextId) -> Result<ContextId> {
        let mut mailbox = self.group.mailbox.lock();
        let Mailbox {
            contexts,
            duplicates,
            next_context,
            ..
        } = &mut *mailbox;
        let seq = duplicates.entry((self.rank, ctx)).or_insert(0);
        let nth = *seq;
        *seq += 1;
        let id = *contexts.entry((ctx, nth)).or_insert_with(|| {
            *next_context += 1;
            ContextId(*next_context)
        });
        Ok(id)
    }

    fn send(&self, ctx: ContextId, dest: i32, tag: i32, data: &[u8]) -> Result<()> {
        self.check_dest(dest, tag)?;
        let mut mailbox = self.group.mailbox.lock();
        mailbox.stats(self.rank).sends += 1;
        mailbox.deposit(Envelope {
            ctx,
            source: self.rank,
            dest,
            tag,
            data: Bytes::copy_from_slice(data),
            send_request: None,
        });
        self.group.changed.notify_all();
        Ok(())
    }

    fn recv(
        &self,
        ctx: ContextId,
        source: i32,
        tag: i32,
        capacity: Option<usize>,
    ) -> Result<Completion> {
        self.check_source(source, tag)?;
        let mut mailbox = self.group.mailbox.lock();
        mailbox.stats(self.rank).recvs += 1;
        let request = self.post_receive(&mut mailbox, ctx, source, tag, capacity);
        self.wait_locked(&mut mailbox, request)
    }

    fn isend(&self, ctx: ContextId, dest: i32, tag: i32, data: Bytes) -> Result<RawRequest> {
        self.check_dest(dest, tag)?;
        let mut mailbox = self.group.mailbox.lock();
        mailbox.stats(self.rank).isends += 1;
        let id = mailbox.next_request();
        let completion = Completion {
            source: self.rank,
            tag,
            len: data.len(),
            cancelled: false,
            data: None,
        };
        let slot = if mailbox.holding.contains(&self.rank) {
            Slot::HeldSend {
                owner: self.rank,
                ctx,
                completion,
            }
        } else {
            Slot::Ready {
                owner: self.rank,
                outcome: Outcome::Done(completion),
            }
        };
        mailbox.slots.insert(id, slot);
        mailbox.deposit(Envelope {
            ctx,
            source: self.rank,
            dest,
            tag,
            data,
            send_request: Some(id),
        });
        self.group.changed.notify_all();
        Ok(RawRequest(id))
    }

    fn irecv(
        &self,
        ctx: ContextId,
        source: i32,
        tag: i32,
        capacity: Option<usize>,
    ) -> Result<RawRequest> {
        self.check_source(source, tag)?;
        let mut mailbox = self.group.mailbox.lock();
        mailbox.stats(self.rank).irecvs += 1;
        let request = self.post_receive(&mut mailbox, ctx, source, tag, capacity);
        if mailbox.progress() {
            self.group.changed.notify_all();
        }
        Ok(request)
    }

    fn wait(&self, request: RawRequest) -> Result<Completion> {
        let mut mailbox = self.group.mailbox.lock();
        mailbox.stats(self.rank).waits += 1;
        self.wait_locked(&mut mailbox, request)
    }

    fn test(&self, request: RawRequest) -> Result<Option<Completion>> {
        let mut mailbox = self.group.mailbox.lock();
        mailbox.stats(self.rank).tests += 1;
        if mailbox.progress() {
            self.group.changed.notify_all();
        }
        mailbox
            .take_ready(self.rank, request)?
            .map(Outcome::into_result)
            .transpose()
    }

    fn cancel(&self, request: RawRequest) -> Result<()> {
        let mut mailbox = self.group.mailbox.lock();
        mailbox.stats(self.rank).cancels += 1;
        mailbox.cancel(self.rank, request)?;
        self.group.changed.notify_all();
        Ok(())
    }

    fn probe(&self, ctx: ContextId, source: i32, tag: i32) -> Result<Status> {
        self.check_source(source, tag)?;
        let mut mailbox = self.group.mailbox.lock();
        loop {
            if mailbox.progress() {
                self.group.changed.notify_all();
            }
            if let Some(status) = mailbox.find_message(self.rank, ctx, source, tag) {
                return Ok(status);
            }
            self.group.changed.wait(&mut mailbox);
        }
    }

    fn iprobe(&self, ctx: ContextId, source: i32, tag: i32) -> Result<Option<Status>> {
        self.check_source(source, tag)?;
        let mut mailbox = self.group.mailbox.lock();
        if mailbox.progress() {
            self.group.changed.notify_all();
        }
        Ok(mailbox.find_message(self.rank, ctx, source, tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const CTX: ContextId = ContextId::WORLD;

    #[test]
    fn blocking_send_and_receive() {
        let ranks = LocalTransport::group(2);
        ranks[0].send(CTX, 1, 3, &[1, 2, 3]).unwrap();
        let completion = ranks[1].recv(CTX, 0, 3, Some(16)).unwrap();
        assert_eq!(completion.source, 0);
        assert_eq!(completion.tag, 3);
        assert_eq!(completion.len, 3);
        assert_eq!(&completion.into_data()[..], &[1, 2, 3]);
        assert_eq!(ranks[0].undelivered(), 0);
    }

    #[test]
    fn messages_do_not_overtake() {
        let ranks = LocalTransport::group(2);
        for i in 0..5u8 {
            ranks[0].send(CTX, 1, 0, &[i]).unwrap();
        }
        let requests: Vec<_> = (0..5)
            .map(|_| ranks[1].irecv(CTX, 0, 0, None).unwrap())
            .collect();
        // Wait in reverse order; matching still follows posting order
        for (i, request) in requests.into_iter().enumerate().rev() {
            let data = ranks[1].wait(request).unwrap().into_data();
            assert_eq!(data[0] as usize, i);
        }
    }

    #[test]
    fn wildcards_match_any_source_and_tag() {
        let ranks = LocalTransport::group(3);
        ranks[2].send(CTX, 0, 42, b"x").unwrap();
        let status = ranks[0].probe(CTX, ANY_SOURCE, ANY_TAG).unwrap();
        assert_eq!((status.source, status.tag, status.count), (2, 42, 1));
        let completion = ranks[0].recv(CTX, ANY_SOURCE, ANY_TAG, None).unwrap();
        assert_eq!(completion.source, 2);
        assert!(ranks[0].iprobe(CTX, ANY_SOURCE, ANY_TAG).unwrap().is_none());
    }

    #[test]
    fn contexts_isolate_messages() {
        let ranks = LocalTransport::group(2);
        let shadow0 = ranks[0].duplicate(CTX).unwrap();
        let shadow1 = ranks[1].duplicate(CTX).unwrap();
        assert_eq!(shadow0, shadow1);
        assert_ne!(shadow0, CTX);
        ranks[0].send(shadow0, 1, 1, b"shadow").unwrap();
        assert!(ranks[1].iprobe(CTX, 0, 1).unwrap().is_none());
        assert!(ranks[1].iprobe(shadow1, 0, 1).unwrap().is_some());
    }

    #[test]
    fn truncation_is_reported_on_completion() {
        let ranks = LocalTransport::group(2);
        ranks[0].send(CTX, 1, 0, &[0u8; 10]).unwrap();
        let request = ranks[1].irecv(CTX, 0, 0, Some(4)).unwrap();
        let err = ranks[1].wait(request).unwrap_err();
        assert_eq!(err.class(), Some(ErrorClass::Truncate));
    }

    #[test]
    fn invalid_rank_is_rejected() {
        let ranks = LocalTransport::group(2);
        let err = ranks[0].send(CTX, 5, 0, b"").unwrap_err();
        assert_eq!(err.class(), Some(ErrorClass::Rank));
        let err = ranks[0].irecv(CTX, 9, 0, None).unwrap_err();
        assert_eq!(err.class(), Some(ErrorClass::Rank));
    }

    #[test]
    fn handles_are_consumed_by_completion() {
        let ranks = LocalTransport::group(2);
        let request = ranks[0].isend(CTX, 1, 0, Bytes::from_static(b"a")).unwrap();
        assert!(ranks[0].test(request).unwrap().is_some());
        let err = ranks[0].test(request).unwrap_err();
        assert_eq!(err.class(), Some(ErrorClass::Request));
    }

    #[test]
    fn other_ranks_cannot_wait_on_a_handle() {
        let ranks = LocalTransport::group(2);
        let request = ranks[0].irecv(CTX, 1, 0, None).unwrap();
        let err = ranks[1].test(request).unwrap_err();
        assert_eq!(err.class(), Some(ErrorClass::Request));
    }

    #[test]
    fn held_sends_complete_on_release() {
        let ranks = LocalTransport::group(2);
        ranks[0].hold_sends(true);
        let request = ranks[0].isend(CTX, 1, 0, Bytes::from_static(b"held")).unwrap();
        assert!(ranks[0].test(request).unwrap().is_none());
        // The message is already visible to the receiver
        assert!(ranks[1].iprobe(CTX, 0, 0).unwrap().is_some());
        assert_eq!(ranks[0].release_sends(Some(CTX)), 1);
        let completion = ranks[0].test(request).unwrap().unwrap();
        assert!(!completion.cancelled);
        assert_eq!(completion.len, 4);
    }

    #[test]
    fn unmatched_held_send_can_be_cancelled() {
        let ranks = LocalTransport::group(2);
        ranks[0].hold_sends(true);
        let request = ranks[0].isend(CTX, 1, 0, Bytes::from_static(b"gone")).unwrap();
        ranks[0].cancel(request).unwrap();
        let completion = ranks[0].wait(request).unwrap();
        assert!(completion.cancelled);
        assert_eq!(completion.len, 0);
        assert_eq!(ranks[0].undelivered(), 0);
    }

    #[test]
    fn matched_send_cannot_be_cancelled() {
        let ranks = LocalTransport::group(2);
        ranks[0].hold_sends(true);
        let request = ranks[0].isend(CTX, 1, 0, Bytes::from_static(b"kept")).unwrap();
        ranks[1].recv(CTX, 0, 0, None).unwrap();
        ranks[0].cancel(request).unwrap();
        assert!(ranks[0].test(request).unwrap().is_none());
        ranks[0].release_sends(None);
        assert!(!ranks[0].wait(request).unwrap().cancelled);
    }

    #[test]
    fn posted_receive_can_be_cancelled() {
        let ranks = LocalTransport::group(2);
        let request = ranks[1].irecv(CTX, 0, 0, None).unwrap();
        ranks[1].cancel(request).unwrap();
        let completion = ranks[1].wait(request).unwrap();
        assert!(completion.cancelled);
        // A later message is not consumed by the cancelled receive
        ranks[0].send(CTX, 1, 0, b"late").unwrap();
        assert_eq!(ranks[0].undelivered(), 1);
    }

    #[test]
    fn wait_blocks_until_message_arrives() {
        let ranks = LocalTransport::group(2);
        let receiver = Arc::clone(&ranks[1]);
        let handle = thread::spawn(move || {
            let request = receiver.irecv(CTX, 0, 9, None).unwrap();
            receiver.wait(request).unwrap().into_data()
        });
        thread::sleep(std::time::Duration::from_millis(20));
        ranks[0].send(CTX, 1, 9, b"late").unwrap();
        assert_eq!(&handle.join().unwrap()[..], b"late");
    }

    #[test]
    fn stats_count_calls_and_messages() {
        let ranks = LocalTransport::group(2);
        let shadow = ranks[0].duplicate(CTX).unwrap();
        ranks[1].duplicate(CTX).unwrap();
        let request = ranks[0].isend(shadow, 1, 0, Bytes::from_static(b"s")).unwrap();
        ranks[0].wait(request).unwrap();
        ranks[0].send(CTX, 1, 0, b"p").unwrap();
        let stats = ranks[0].stats();
        assert_eq!(stats.isends, 1);
        assert_eq!(stats.sends, 1);
        assert_eq!(stats.waits, 1);
        assert_eq!(stats.messages_on(shadow), 1);
        assert_eq!(stats.messages_on(CTX), 1);
        assert_eq!(stats.messages(), 2);
        assert_eq!(ranks[1].stats().messages(), 0);
    }
}
