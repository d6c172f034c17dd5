//! # ferrompi-serde
//!
//! Nonblocking requests and serialized transfers on top of a message-passing
//! transport.
//!
//! This crate layers the parts of an MPI binding that are hard to get right
//! over a small byte-oriented [`Transport`](transport::Transport):
//! - Request handles with a cached terminal state for nonblocking sends and
//!   receives, including two-leg serialized transfers (a header on the
//!   primary channel, the payload on a shadow channel)
//! - Shadow-channel tag allocation with exactly-once release
//! - [`RequestList`] for waiting on many requests at once
//! - A large-object engine that streams serialized values in fixed-size
//!   chunks, with gather, scatter and all-to-all driven by a worker pool
//!
//! [`LocalTransport`] simulates a group of ranks inside one process.
//!
//! ## Supported Types
//!
//! Fixed-layout operations are generic over [`MpiDatatype`]:
//! `f32`, `f64`, `i32`, `i64`, `u8`, `u32`, `u64`.
//! Serialized operations take any `serde` type.
//!
//! ## Quick Start
//!
//! ```
//! use std::thread;
//! use ferrompi_serde::{Communicator, EngineConfig, LocalTransport, ANY_SOURCE};
//!
//! fn ring(world: Communicator) -> Result<String, ferrompi_serde::Error> {
//!     let (rank, size) = (world.rank(), world.size());
//!     if rank == 0 {
//!         world.send_serialized("Rosie", 1, 0)?;
//!         let (msg, _) = world.recv_serialized::<String>(ANY_SOURCE, 0)?;
//!         Ok(msg)
//!     } else {
//!         let (msg, _) = world.recv_serialized::<String>(rank - 1, 0)?;
//!         let msg = format!("{msg}, {rank}");
//!         world.send_serialized(&msg, (rank + 1) % size, 0)?;
//!         Ok(msg)
//!     }
//! }
//!
//! let handles: Vec<_> = LocalTransport::group(3)
//!     .into_iter()
//!     .map(|transport| {
//!         thread::spawn(move || {
//!             let world = Communicator::new(transport, EngineConfig::default())?;
//!             ring(world)
//!         })
//!     })
//!     .collect();
//! let results: Vec<String> = handles
//!     .into_iter()
//!     .map(|h| h.join().unwrap().unwrap())
//!     .collect();
//! assert_eq!(results[0], "Rosie, 1, 2");
//! ```
//!
//! ## Configuration
//!
//! [`EngineConfig`] holds the chunking and worker-pool settings;
//! [`EngineConfig::from_env`] reads them from `FERROMPI_SERDE_*` variables.
//!
//! ## Logging
//!
//! The crate logs through `tracing` and never installs a subscriber.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

mod codec;
mod comm;
mod config;
mod datatype;
mod engine;
mod error;
mod header;
mod pipe;
mod request;
mod status;
mod tag;
pub mod transport;

pub use comm::Communicator;
pub use config::{
    EngineConfig, DEFAULT_BUFFER_SIZE, DEFAULT_STALE_REPORT_INTERVAL, DEFAULT_WORKERS,
};
pub use datatype::MpiDatatype;
pub use engine::LargeObjectEngine;
pub use error::{Error, ErrorClass, Result};
pub use header::SerializedMessageHeader;
pub use pipe::{BlockReader, BlockSummary, BlockWriter, BytePipe};
pub use request::{ReceiveRequest, Request, RequestId, RequestKind, RequestList};
pub use status::Status;
pub use tag::{TagAllocator, COLLECTIVE_TAG};
pub use transport::{LocalTransport, TransportStats, ANY_SOURCE, ANY_TAG};
