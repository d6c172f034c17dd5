//! Ping-pong example - rank 0 pings every other rank and waits for its reply.
//!
//! Run with: cargo run --example ping_pong -- 4

use std::thread;

use ferrompi_serde::{Communicator, EngineConfig, LocalTransport, Result};

const PING: i32 = 0;
const PONG: i32 = 1;

fn rank_main(world: Communicator) -> Result<()> {
    let rank = world.rank();
    if rank == 0 {
        println!("Rank 0 is alive on {}", host_name(rank));
        for dest in 1..world.size() {
            println!("Pinging process with rank {dest}...");
            world.send_serialized("Ping!", dest, PING)?;
            let (host, _) = world.recv_serialized::<String>(dest, PONG)?;
            println!(" Pong!");
            println!("  Rank {dest} is alive on {host}");
        }
    } else {
        let (ping, _) = world.recv_serialized::<String>(0, PING)?;
        assert_eq!(ping, "Ping!");
        world.send_serialized(&host_name(rank), 0, PONG)?;
    }
    Ok(())
}

fn host_name(rank: i32) -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into());
    format!("{host} (thread {rank})")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let size: usize = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(4);

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
