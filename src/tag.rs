//! Tag allocation for the shadow channel.
//!
//! Every nonblocking serialized send puts its payload on the shadow channel
//! under a tag that no other outstanding serialized send of the same
//! communicator is using. The receiver learns the tag from the header message.
//!
//! Tag [`COLLECTIVE_TAG`] is reserved for collective bookkeeping and is never
//! handed out. Exhaustion is not checked here: a transport with a tag ceiling
//! reports it when the tag is used.

use std::sync::Arc;

use parking_lot::Mutex;

/// Tag reserved for collective operations on the shadow channel.
pub const COLLECTIVE_TAG: i32 = 0;

/// Issues and recycles shadow-channel tags.
///
/// The pool is guarded by a mutex so it can be shared by every thread that
/// issues serialized sends on a communicator.
#[derive(Debug)]
pub struct TagAllocator {
    pool: Mutex<TagPool>,
}

#[derive(Debug)]
struct TagPool {
    /// One past the highest tag handed out so far.
    next: i32,
    /// Returned tags below `next - 1`.
    free: Vec<i32>,
}

impl Default for TagAllocator {
    fn default() -> Self {
        TagAllocator::new()
    }
}

impl TagAllocator {
    /// Create an allocator whose first tag is `COLLECTIVE_TAG + 1`.
    pub fn new() -> Self {
        TagAllocator {
            pool: Mutex::new(TagPool {
                next: COLLECTIVE_TAG + 1,
                free: Vec::new(),
            }),
        }
    }

    /// Take a tag, preferring the most recently returned one.
    pub fn allocate(&self) -> i32 {
        let mut pool = self.pool.lock();
        if let Some(tag) = pool.free.pop() {
            return tag;
        }
        let tag = pool.next;
        pool.next += 1;
        tag
    }

    /// Give a tag back.
    ///
    /// Returning the highest outstanding tag shrinks the counter instead of
    /// growing the free list.
    pub fn release(&self, tag: i32) {
        debug_assert_ne!(tag, COLLECTIVE_TAG, "the collective tag is never allocated");
        let mut pool = self.pool.lock();
        if tag == pool.next - 1 {
            pool.next -= 1;
        } else {
            pool.free.push(tag);
        }
    }

    /// Allocate a tag that is released when the lease is dropped.
    pub(crate) fn lease(self: &Arc<Self>) -> TagLease {
        TagLease {
            tag: self.allocate(),
            allocator: Arc::clone(self),
        }
    }
}

/// An allocated tag, returned to its allocator exactly once on drop.
#[derive(Debug)]
pub(crate) struct TagLease {
    tag: i32,
    allocator: Arc<TagAllocator>,
}

impl TagLease {
    pub(crate) fn tag(&self) -> i32 {
        self.tag
    }

    /// Never return this tag.
    ///
    /// Used when a transfer is abandoned while its payload may still be in
    /// flight: recycling the tag could pair a later header with the stale payload.
    pub(crate) fn leak(self) {
        std::mem::forget(self);
    }
}

impl Drop for TagLease {
    fn drop(&mut self) {
        self.allocator.release(self.tag);
    }
}
