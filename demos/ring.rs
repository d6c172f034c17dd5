//! Ring example - a serialized message travels once around the group.
//!
//! Rank 0 starts a string; every other rank appends its rank and passes it on.
//! Ranks are threads over an in-process transport.
//!
//! Run with: cargo run --example ring -- 4

use std::thread;

use ferrompi_serde::{Communicator, EngineConfig, LocalTransport, Result, ANY_SOURCE};

fn rank_main(world: Communicator) -> Result<()> {
    let rank = world.rank();
    let size = world.size();

    if rank == 0 {
        world.send_serialized("Rosie", 1, 0)?;
        let (msg, status) = world.recv_serialized::<String>(ANY_SOURCE, 0)?;
        println!("Rank {rank} received message \"{msg}\" from rank {}.", status.source);
    } else {
        let (msg, _) = world.recv_serialized::<String>(rank - 1, 0)?;
        println!("Rank {rank} received message \"{msg}\".");
        world.send_serialized(&format!("{msg}, {rank}"), (rank + 1) % size, 0)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let size: usize = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(4);
    if size < 2 {
        eprintln!("This example requires at least 2 ranks");
        return Ok(());
    }

    let handles: Vec<_> = LocalTransport::group(size)
        .into_iter()
        .map(|transport| {
            thread::spawn(move || {
                let world = Communicator::new(transport, EngineConfig::from_env())?;
                rank_main(world)
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("rank thread panicked")?;
    }
    Ok(())
}
