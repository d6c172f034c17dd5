//! Completion status of a finished transfer.
//!
//! This module provides the [`Status`] record returned by request completion
//! and probe operations.

/// Information about a completed, cancelled or probed message.
///
/// A `Status` is a snapshot: requests cache the value they report on the
/// transition to a terminal state and hand out copies of it afterwards.
///
/// # Example
///
/// ```no_run
/// # use ferrompi_serde::{Communicator, EngineConfig, LocalTransport};
/// # let transport = LocalTransport::group(1).remove(0);
/// let world = Communicator::new(transport, EngineConfig::default()).unwrap();
///
/// let status = world.probe(-1, -1).unwrap();
/// println!("Message from rank {} with tag {}, {} elements",
///          status.source, status.tag, status.count);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    /// Source rank of the message.
    pub source: i32,
    /// Tag of the message.
    pub tag: i32,
    /// Number of elements transferred (bytes for serialized payloads).
    pub count: i64,
}

impl Status {
    pub(crate) fn new(source: i32, tag: i32, count: i64) -> Self {
        Status { source, tag, count }
    }

    /// Status with the count forced to zero, as reported for cancelled requests.
    pub(crate) fn cancelled(source: i32, tag: i32) -> Self {
        Status::new(source, tag, 0)
    }
}
