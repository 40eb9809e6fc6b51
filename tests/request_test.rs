//! Request/response, rejection, cancellation and conversations

mod common;

use common::{recv, wait_until, Harness, WAIT};
use liteconn::{LiteError, ManagerConfig};
use std::time::Duration;

#[test]
fn test_respond_resolves_request() {
    let h = Harness::new();
    let request = h.client.send_request(b"ping").unwrap();

    let mut message = recv(&h.server);
    assert_eq!(&message.payload()[..], b"ping");
    assert!(message.is_request());
    let handle = message.take_request().unwrap();
    assert_eq!(handle.id(), request.id());
    assert!(handle.respond(b"pong").unwrap());

    let response = request.get_response().unwrap();
    assert_eq!(&response.payload()[..], b"pong");
    assert!(!response.is_request());
    assert_eq!(h.client.outstanding_requests(), 0);
}

#[test]
fn test_requests_flow_both_ways() {
    let h = Harness::new();
    let request = h.server.send_request(b"from server").unwrap();
    let (payload, handle) = recv(&h.client).into_parts();
    assert_eq!(&payload[..], b"from server");
    handle.unwrap().respond(b"from client").unwrap();
    assert_eq!(&request.get_response().unwrap().payload()[..], b"from client");
}

#[test]
fn test_respond_through_connection() {
    let h = Harness::new();
    let request = h.client.send_request(b"q").unwrap();
    let mut message = recv(&h.server);
    let handle = message.take_request().unwrap();
    let id = handle.id();

    assert!(h.server.respond(id, b"a").unwrap());
    assert!(!h.server.respond(id, b"again").unwrap());
    assert!(!h.server.reject(id));
    // The handle's obligation is gone with the first reply.
    assert!(!handle.reject());

    assert_eq!(&request.get_response().unwrap().payload()[..], b"a");
}

#[test]
fn test_reject_resolves_to_none() {
    let h = Harness::new();
    let request = h.client.send_request(b"no thanks").unwrap();
    let handle = recv(&h.server).take_request().unwrap();
    assert!(handle.reject());
    assert!(request.get_response().is_none());
}

#[test]
fn test_dropped_response_handle_rejects() {
    let h = Harness::new();
    let request = h.client.send_request(b"ignored").unwrap();
    drop(recv(&h.server));
    assert!(request.wait_for_response(Some(WAIT)));
    assert!(request.get_response().is_none());
}

#[test]
fn test_cancel_frees_peer_obligation() {
    let h = Harness::new();
    let request = h.client.send_request(b"never mind").unwrap();
    let handle = recv(&h.server).take_request().unwrap();

    assert!(request.cancel());
    assert!(request.is_ready());
    assert!(request.get_response().is_none());
    assert!(!request.cancel());

    // Once the CXL is acked the server no longer owes a reply.
    assert!(wait_until(WAIT, || h.client.pending_reliable() == 0));
    assert!(!handle.respond(b"too late").unwrap());
}

#[test]
fn test_peer_disconnect_fails_outstanding_requests() {
    let h = Harness::new();
    let request = h.client.send_request(b"hello?").unwrap();
    let _message = recv(&h.server);

    h.server.disconnect();
    assert!(request.wait_for_response(Some(WAIT)));
    assert!(request.get_response().is_none());
    assert!(h.client.is_disconnected());
}

#[test]
fn test_conversation_preserves_turn_order() {
    let h = Harness::new();
    let turns = 8;

    let mut pending = h.client.send_request(b"turn-0").unwrap();
    let mut inbound = recv(&h.server);
    let mut observed = vec![inbound.payload().to_vec()];

    for turn in 1..turns {
        let handle = inbound.take_request().unwrap();
        let next = handle
            .converse(format!("turn-{turn}").as_bytes())
            .unwrap()
            .unwrap();
        inbound = pending.get_response().unwrap();
        observed.push(inbound.payload().to_vec());
        pending = next;
    }

    inbound.take_request().unwrap().respond(b"done").unwrap();
    assert_eq!(&pending.get_response().unwrap().payload()[..], b"done");

    let expected: Vec<Vec<u8>> = (0..turns)
        .map(|turn| format!("turn-{turn}").into_bytes())
        .collect();
    assert_eq!(observed, expected);
}

#[test]
fn test_oversized_payloads_are_refused() {
    let config = ManagerConfig::testing().max_datagram_size(128);
    let h = Harness::with_config(config);
    let too_big = vec![7u8; 128];

    assert!(matches!(h.client.send_data(&too_big), Err(LiteError::Buffer { .. })));
    assert!(matches!(h.client.send_request(&too_big), Err(LiteError::Buffer { .. })));

    let request = h.client.send_request(b"small").unwrap();
    let handle = recv(&h.server).take_request().unwrap();
    assert!(matches!(handle.respond(&too_big), Err(LiteError::Buffer { .. })));
    // The failed reply dropped the handle, which rejected the request.
    assert!(request.wait_for_response(Some(Duration::from_secs(1))));
    assert!(request.get_response().is_none());
}
