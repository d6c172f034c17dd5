//! Chunked transfers and bulk operations between simulated ranks.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{run_group, small_config};
use ferrompi_serde::transport::ContextId;
use ferrompi_serde::{Communicator, EngineConfig, Error, LocalTransport, Status};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Record {
    origin: i32,
    dest: i32,
    payload: Vec<u32>,
    labels: BTreeMap<String, f64>,
}

/// What rank `origin` sends to rank `dest`; a few hundred bytes encoded.
fn record(origin: i32, dest: i32) -> Record {
    Record {
        origin,
        dest,
        payload: (0..(origin * 10 + dest) as u32).collect(),
        labels: [(format!("from-{origin}"), origin as f64 / 2.0)].into(),
    }
}

#[test]
fn chunk_boundaries_round_trip() {
    const BLOCK: usize = 32;
    let ranks = LocalTransport::group(2);
    let config = EngineConfig::default().with_buffer_size(BLOCK);
    let a = Communicator::new(ranks[0].clone(), config.clone()).unwrap();
    let b = Communicator::new(ranks[1].clone(), config).unwrap();

    for size in [0, 1, BLOCK - 1, BLOCK, BLOCK + 1, 3 * BLOCK] {
        let before = ranks[0].stats().messages_on(ContextId::WORLD);
        let status: Status = if size == 0 {
            a.send_large(&(), 1, 2).unwrap();
            let ((), status) = b.receive_large::<()>(0, 2).unwrap();
            status
        } else {
            // A byte vector shorter than 251 encodes as one length byte plus its bytes
            let value = vec![0xA5u8; size - 1];
            a.send_large(&value, 1, 2).unwrap();
            let (received, status) = b.receive_large::<Vec<u8>>(0, 2).unwrap();
            assert_eq!(received, value, "size {size}");
            status
        };
        assert_eq!(status.count, size as i64);
        assert_eq!((status.source, status.tag), (0, 2));

        let messages = ranks[0].stats().messages_on(ContextId::WORLD) - before;
        let chunks = if size == 0 { 1 } else { size.div_ceil(BLOCK) };
        // Each chunk is a length message plus a data message unless it is empty
        let expected = if size == 0 { 1 } else { 2 * chunks };
        assert_eq!(messages, expected, "size {size}");
        assert_eq!(ranks[0].undelivered(), 0);
    }
}

#[test]
fn unsplit_tier_sends_one_chunk() {
    let ranks = LocalTransport::group(2);
    let config = EngineConfig::default()
        .with_buffer_size(8)
        .with_split_large_objects(false);
    let a = Communicator::new(ranks[0].clone(), config.clone()).unwrap();
    let b = Communicator::new(ranks[1].clone(), config).unwrap();

    let value = record(0, 1);
    a.send_large(&value, 1, 0).unwrap();
    assert_eq!(ranks[0].stats().messages(), 2);
    let (received, _) = b.receive_large::<Record>(0, 0).unwrap();
    assert_eq!(received, value);
}

#[test]
fn gather_collects_in_rank_order() {
    let results = run_group(4, small_config(), |world| {
        world
            .gather_serialized(record(world.rank(), 2), 2)
            .unwrap()
    });
    for (rank, gathered) in results.iter().enumerate() {
        if rank == 2 {
            let expected: Vec<Record> = (0..4).map(|origin| record(origin, 2)).collect();
            assert_eq!(gathered, &expected);
        } else {
            assert!(gathered.is_empty());
        }
    }
}

#[test]
fn gather_reuses_the_output_buffer() {
    let results = run_group(3, small_config(), |world| {
        let mut out = Vec::with_capacity(16);
        for round in 0..3 {
            world
                .gather_serialized_into(format!("{}:{round}", world.rank()), 0, &mut out)
                .unwrap();
        }
        out
    });
    assert_eq!(results[0], ["0:2", "1:2", "2:2"]);
    assert!(results[1].is_empty());
}

#[test]
fn scatter_delivers_each_rank_its_value() {
    let results = run_group(4, small_config(), |world| {
        let values = if world.rank() == 1 {
            (0..4).map(|dest| record(1, dest)).collect()
        } else {
            Vec::new()
        };
        world.scatter_serialized(values, 1).unwrap()
    });
    for (rank, value) in results.into_iter().enumerate() {
        assert_eq!(value, record(1, rank as i32));
    }
}

#[test]
fn alltoall_is_self_consistent() {
    const K: usize = 5;
    let results = run_group(K, small_config(), |world| {
        let me = world.rank();
        let values: Vec<Record> = (0..world.size()).map(|dest| record(me, dest)).collect();
        world.alltoall_serialized(values).unwrap()
    });
    for (j, received) in results.iter().enumerate() {
        assert_eq!(received.len(), K);
        for (i, value) in received.iter().enumerate() {
            assert_eq!(value, &record(i as i32, j as i32), "rank {j} from {i}");
        }
    }
}

#[test]
fn alltoall_flattened_concatenates_blocks() {
    let results = run_group(3, small_config(), |world| {
        let me = world.rank() as usize;
        // Rank r sends r + 1 copies of its rank to everyone
        let send_counts = vec![me + 1; 3];
        let recv_counts = vec![1, 2, 3];
        let values = vec![me as u64; 3 * (me + 1)];
        world
            .alltoall_flattened(values, &send_counts, &recv_counts)
            .unwrap()
    });
    for received in results {
        assert_eq!(received, vec![0, 1, 1, 2, 2, 2]);
    }
}

#[test]
fn alltoall_flattened_rejects_unexpected_lengths() {
    let results = run_group(2, small_config(), |world| {
        let values = vec![7i32; 4];
        // Every rank sends two elements to each rank but expects three
        world.alltoall_flattened(values, &[2, 2], &[3, 3])
    });
    for result in results {
        assert!(matches!(result, Err(Error::Protocol(_))), "got: {result:?}");
    }
}

#[test]
fn bulk_operations_on_a_duplicate() {
    let results = run_group(3, small_config(), |world| {
        let dup = world.duplicate().unwrap();
        let me = world.rank();
        // Same pattern on both communicators; streams must not cross
        let a = world
            .alltoall_serialized(vec![format!("world {me}"); 3])
            .unwrap();
        let b = dup.alltoall_serialized(vec![format!("dup {me}"); 3]).unwrap();
        (a, b)
    });
    for (a, b) in results {
        assert_eq!(a, ["world 0", "world 1", "world 2"]);
        assert_eq!(b, ["dup 0", "dup 1", "dup 2"]);
    }
}

#[test]
fn slow_batch_still_drains_with_frequent_reports() {
    let config = small_config().with_stale_report_interval(Duration::from_millis(1));
    let results = run_group(3, config, |world| {
        if world.rank() == 0 {
            // The other ranks' batches wait on this one for a while
            std::thread::sleep(Duration::from_millis(20));
        }
        world
            .alltoall_serialized(vec![world.rank(); 3])
            .unwrap()
    });
    for received in results {
        assert_eq!(received, vec![0, 1, 2]);
    }
}

#[test]
fn single_rank_bulk_operations() {
    let results = run_group(1, small_config(), |world| {
        let gathered = world.gather_serialized(String::from("solo"), 0).unwrap();
        let scattered = world.scatter_serialized(vec![3u8], 0).unwrap();
        let exchanged = world.alltoall_serialized(vec![(1, 2)]).unwrap();
        (gathered, scattered, exchanged)
    });
    assert_eq!(
        results[0],
        (vec![String::from("solo")], 3u8, vec![(1, 2)])
    );
}
