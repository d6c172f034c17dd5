//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;

use ferrompi_serde::{Communicator, EngineConfig, LocalTransport};

/// Small blocks and few workers, so short values already span several chunks.
pub fn small_config() -> EngineConfig {
    EngineConfig::default()
        .with_workers(4)
        .with_buffer_size(32)
}

/// Run `f` once per rank of a fresh `size`-rank group, each on its own thread.
///
/// Returns the results in rank order; a panic on any rank fails the test.
pub fn run_group<R, F>(size: usize, config: EngineConfig, f: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(Communicator) -> R + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = LocalTransport::group(size)
        .into_iter()
        .map(|transport| {
            let f = Arc::clone(&f);
            let config = config.clone();
            thread::Builder::new()
                .name(format!("rank-{}", transport_rank(&transport)))
                .spawn(move || f(Communicator::new(transport, config).unwrap()))
                .unwrap()
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect()
}

fn transport_rank(transport: &LocalTransport) -> i32 {
    use ferrompi_serde::transport::Transport;
    transport.rank()
}
