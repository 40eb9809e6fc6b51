//! Reliable delivery under loss and duplication, and queue backpressure

mod common;

use common::{recv, wait_until, Harness, WAIT};
use liteconn::{FaultModel, ManagerConfig};
use std::collections::HashSet;
use std::time::Duration;

const QUEUE: usize = 4;

fn collect(h: &Harness, expected: usize) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    while out.len() < expected {
        out.push(recv(&h.server).payload().to_vec());
    }
    out
}

#[test]
fn test_reliable_delivery_under_loss() {
    let faults = FaultModel {
        loss_rate: 0.3,
        duplicate_rate: 0.2,
    };
    let h = Harness::build(ManagerConfig::testing(), |server, client| {
        server.set_faults(faults);
        client.set_faults(faults);
    });

    let sent: Vec<Vec<u8>> = (0..50).map(|i| format!("msg-{i}").into_bytes()).collect();
    for payload in &sent {
        h.client.send_reliable_data(payload).unwrap();
    }

    let received = collect(&h, sent.len());
    let unique: HashSet<_> = received.iter().cloned().collect();
    assert_eq!(unique.len(), sent.len());
    assert_eq!(unique, sent.iter().cloned().collect::<HashSet<_>>());

    assert!(wait_until(WAIT, || h.client.pending_reliable() == 0));
    std::thread::sleep(Duration::from_millis(100));
    assert!(h.server.receive().is_none(), "payload delivered twice");
    assert!(h.client.stats().retransmissions > 0);
}

#[test]
fn test_duplicates_are_suppressed() {
    let h = Harness::build(ManagerConfig::testing(), |server, client| {
        server.set_faults(FaultModel::duplicating(1.0));
        client.set_faults(FaultModel::duplicating(1.0));
    });

    for i in 0..10u8 {
        h.client.send_reliable_data(&[i]).unwrap();
    }
    let received = collect(&h, 10);
    let expected: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i]).collect();
    assert_eq!(received.len(), 10);
    assert_eq!(
        received.iter().cloned().collect::<HashSet<_>>(),
        expected.into_iter().collect::<HashSet<_>>()
    );

    std::thread::sleep(Duration::from_millis(100));
    assert!(h.server.receive().is_none());
    assert!(h.server.stats().duplicates_suppressed >= 10);
}

#[test]
fn test_full_queue_defers_reliable_sends() {
    let h = Harness::with_config(ManagerConfig::testing().packet_queue_capacity(QUEUE));
    for i in 0..QUEUE + 2 {
        h.client.send_reliable_data(&[i as u8]).unwrap();
    }

    assert!(wait_until(WAIT, || h.server.queued_messages() == QUEUE));
    assert!(wait_until(WAIT, || h.client.pending_reliable() == 2));

    // Several retry intervals pass; nothing beyond the bound gets in.
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(h.server.queued_messages(), QUEUE);
    assert_eq!(h.client.pending_reliable(), 2);
    assert!(h.server.stats().deliveries_deferred > 0);
    assert_eq!(h.server.stats().unreliable_dropped, 0);

    let mut received: HashSet<u8> = HashSet::new();
    while let Some(message) = h.server.receive() {
        received.insert(message.payload()[0]);
    }
    assert_eq!(received.len(), QUEUE);

    assert!(wait_until(WAIT, || h.server.queued_messages() == 2));
    while let Some(message) = h.server.receive() {
        received.insert(message.payload()[0]);
    }
    assert_eq!(received, (0..(QUEUE + 2) as u8).collect());
    assert!(wait_until(WAIT, || h.client.pending_reliable() == 0));
}

#[test]
fn test_full_queue_drops_unreliable_sends() {
    let h = Harness::with_config(ManagerConfig::testing().packet_queue_capacity(QUEUE));
    for i in 0..QUEUE + 2 {
        h.client.send_data(&[i as u8]).unwrap();
    }

    assert!(wait_until(WAIT, || h.server.stats().unreliable_dropped == 2));
    assert_eq!(h.server.queued_messages(), QUEUE);
    assert_eq!(h.client.pending_reliable(), 0);

    let first: Vec<u8> = std::iter::from_fn(|| h.server.receive())
        .map(|m| m.payload()[0])
        .collect();
    assert_eq!(first, vec![0, 1, 2, 3]);
}
