//! Point-to-point transfers between simulated ranks.

mod common;

use common::{run_group, small_config};
use ferrompi_serde::transport::ContextId;
use ferrompi_serde::{
    Communicator, EngineConfig, Error, LocalTransport, RequestList, Status, ANY_SOURCE, ANY_TAG,
};

#[test]
fn ring_passes_a_growing_string() {
    let results = run_group(4, EngineConfig::default(), |world| {
        let (rank, size) = (world.rank(), world.size());
        if rank == 0 {
            world.send_serialized("Rosie", 1, 0).unwrap();
            world.recv_serialized::<String>(ANY_SOURCE, 0).unwrap()
        } else {
            let (msg, status) = world.recv_serialized::<String>(rank - 1, 0).unwrap();
            assert_eq!(status.source, rank - 1);
            let msg = format!("{msg}, {rank}");
            world.send_serialized(&msg, (rank + 1) % size, 0).unwrap();
            (msg, status)
        }
    });
    let (msg, status) = &results[0];
    assert_eq!(msg, "Rosie, 1, 2, 3");
    assert_eq!((status.source, status.tag), (3, 0));
}

#[test]
fn ping_pong_with_every_rank() {
    let results = run_group(4, EngineConfig::default(), |world| {
        let rank = world.rank();
        let mut replies = Vec::new();
        if rank == 0 {
            for dest in 1..world.size() {
                world.send_serialized("Ping!", dest, 0).unwrap();
                let (reply, _) = world.recv_serialized::<String>(dest, 1).unwrap();
                replies.push(reply);
            }
        } else {
            let (ping, _) = world.recv_serialized::<String>(0, 0).unwrap();
            world.send_serialized(&format!("{ping} from {rank}"), 0, 1).unwrap();
        }
        replies
    });
    assert_eq!(
        results[0],
        ["Ping! from 1", "Ping! from 2", "Ping! from 3"]
    );
}

#[test]
fn nonblocking_ring_through_a_request_list() {
    let results = run_group(3, EngineConfig::default(), |world| {
        let (rank, size) = (world.rank(), world.size());
        let next = (rank + 1) % size;
        let prev = (rank + size - 1) % size;

        let mut list = RequestList::new();
        let fixed = list.add(world.irecv::<f64>(prev, 10, 2).unwrap());
        let serialized = list.add(world.irecv_serialized::<Vec<String>>(prev, 11).unwrap());
        list.add(world.isend(&[rank as f64, 0.5], next, 10).unwrap());
        list.add(
            world
                .isend_serialized(&vec![format!("from {rank}")], next, 11)
                .unwrap(),
        );

        let mut done = list.wait_all().unwrap();
        assert!(list.is_empty());
        let mut take = |id| {
            let index = done.iter().position(|(r, _)| r.id() == id).unwrap();
            done.remove(index)
        };
        let (mut fixed, fixed_status) = take(fixed);
        let (mut serialized, _) = take(serialized);
        (
            fixed.take_value::<Vec<f64>>().unwrap(),
            fixed_status,
            serialized.take_value::<Vec<String>>().unwrap(),
        )
    });
    for (rank, (values, status, words)) in results.into_iter().enumerate() {
        let prev = (rank + 2) % 3;
        assert_eq!(values, vec![prev as f64, 0.5]);
        assert_eq!(status, Status { source: prev as i32, tag: 10, count: 2 });
        assert_eq!(words, vec![format!("from {prev}")]);
    }
}

#[test]
fn wildcard_receive_reports_the_logical_tag() {
    let ranks = LocalTransport::group(2);
    let a = Communicator::new(ranks[0].clone(), EngineConfig::default()).unwrap();
    let b = Communicator::new(ranks[1].clone(), EngineConfig::default()).unwrap();

    a.send_serialized(&42u64, 1, 17).unwrap();
    let (value, status) = b.recv_serialized::<u64>(ANY_SOURCE, ANY_TAG).unwrap();
    assert_eq!(value, 42);
    assert_eq!((status.source, status.tag), (0, 17));
}

#[test]
fn serialized_send_waits_for_both_legs() {
    let ranks = LocalTransport::group(2);
    let a = Communicator::new(ranks[0].clone(), EngineConfig::default()).unwrap();
    let b = Communicator::new(ranks[1].clone(), EngineConfig::default()).unwrap();

    ranks[0].hold_sends(true);
    let mut send = a.isend_serialized(&String::from("two legs"), 1, 3).unwrap();
    // Only the header leg, which travels on the primary channel
    assert_eq!(ranks[0].release_sends(Some(ContextId::WORLD)), 1);
    assert!(send.test().unwrap().is_none());
    assert!(send.is_pending());

    ranks[0].release_sends(None);
    ranks[0].hold_sends(false);
    let status = send.wait().unwrap();
    assert_eq!(status.tag, 3);
    assert_eq!(send.wait().unwrap(), status);

    let (text, _) = b.recv_serialized::<String>(0, 3).unwrap();
    assert_eq!(text, "two legs");
}

#[test]
fn empty_value_sends_only_a_header() {
    let ranks = LocalTransport::group(2);
    let a = Communicator::new(ranks[0].clone(), EngineConfig::default()).unwrap();
    let b = Communicator::new(ranks[1].clone(), EngineConfig::default()).unwrap();

    a.send_serialized(&(), 1, 0).unwrap();
    let stats = ranks[0].stats();
    assert_eq!(stats.messages(), 1);
    assert_eq!(stats.messages_on(ContextId::WORLD), 1);

    let ((), status) = b.recv_serialized::<()>(0, 0).unwrap();
    assert_eq!(status.count, 0);
    assert_eq!(ranks[1].stats().irecvs, 1);
}

#[test]
fn cancelled_receive_has_no_value() {
    let ranks = LocalTransport::group(2);
    let b = Communicator::new(ranks[1].clone(), EngineConfig::default()).unwrap();

    let mut receive = b.irecv_serialized::<String>(0, 5).unwrap();
    let status = receive.cancel().unwrap();
    assert_eq!(status.count, 0);
    assert!(receive.is_cancelled());
    assert!(matches!(receive.wait_value(), Err(Error::Cancelled)));
}

#[test]
fn receive_into_a_caller_buffer() {
    let results = run_group(2, small_config(), |world| {
        if world.rank() == 0 {
            world.send_serialized(&vec![1u16, 2, 3], 1, 0).unwrap();
            world.send_serialized(&vec![1u16, 2, 3], 1, 1).unwrap();
            None
        } else {
            let fits = world
                .irecv_serialized_into(vec![0u16; 5], 0, 0)
                .unwrap()
                .wait_value()
                .unwrap()
                .0;
            let overflow = world
                .irecv_serialized_into(vec![0u16; 2], 0, 1)
                .unwrap()
                .wait_value();
            Some((fits, overflow))
        }
    });
    let (fits, overflow) = results.into_iter().nth(1).flatten().unwrap();
    assert_eq!(fits, vec![1, 2, 3, 0, 0]);
    assert!(matches!(
        overflow,
        Err(Error::Overflow {
            received: 3,
            capacity: 2
        })
    ));
}
