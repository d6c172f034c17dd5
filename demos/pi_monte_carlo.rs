//! Monte Carlo Pi estimation - darts thrown on every rank, counts reduced at rank 0.
//!
//! Run with: cargo run --release --example pi_monte_carlo -- 4 100000

use std::thread;

use ferrompi_serde::{Communicator, EngineConfig, LocalTransport, Result};
use rand::Rng;

fn rank_main(world: Communicator, darts: u64) -> Result<()> {
    let mut rng = rand::thread_rng();
    let mut inside: u64 = 0;
    for _ in 0..darts {
        let x: f64 = rng.gen_range(-1.0..1.0);
        let y: f64 = rng.gen_range(-1.0..1.0);
        if x * x + y * y <= 1.0 {
            inside += 1;
        }
    }

    if let Some(total) = world.reduce_serialized(inside, |a, b| a + b, 0)? {
        let thrown = darts * world.size() as u64;
        let pi = 4.0 * total as f64 / thrown as f64;
        println!("Pi is approximately {pi:.6} ({thrown} darts)");
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let size: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(4);
    let darts: u64 = args.next().and_then(|a| a.parse().ok()).unwrap_or(10_000);

    let handles: Vec<_> = LocalTransport::group(size)
        .into_iter()
        .map(|transport| {
            thread::spawn(move || {
                let world = Communicator::new(transport, EngineConfig::from_env())?;
                rank_main(world, darts)
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("rank thread panicked")?;
    }
    Ok(())
}
