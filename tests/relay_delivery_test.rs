//! Relay Delivery Tests
//!
//! Store-and-forward delivery, queue drains, acknowledgements, and the
//! online takeover race between sockets.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use courier_relay::store::MessageType;
use courier_relay::ws::protocol;

mod common;

/// Offline recipient: the message is queued, drained once, then gone.
#[test]
fn test_offline_delivery_roundtrip() {
    let h = common::harness();
    let eve = common::register_user(&h.store, "eve");
    let dave = common::register_user(&h.store, "dave");
    common::login(&h.auth, &eve, "device-e");
    common::login(&h.auth, &dave, "device-d");

    let outcome = h
        .relay
        .send(&eve.user.id, &dave.user.id, "aGVsbG8=", MessageType::SignalMessage)
        .unwrap();
    assert!(!outcome.delivered);
    let message_id = outcome.message_id.expect("queued message id");

    let drained = h.relay.fetch_offline(&dave.user.id, 10).unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].id, message_id);
    assert_eq!(drained[0].sender_id, eve.user.id);
    assert_eq!(drained[0].ciphertext, "aGVsbG8=");
    assert_eq!(drained[0].message_type, MessageType::SignalMessage);

    // An immediate second fetch returns nothing.
    assert!(h.relay.fetch_offline(&dave.user.id, 10).unwrap().is_empty());
}

/// Online recipient: the ciphertext goes over the socket channel, not the
/// queue, and arrives unmodified.
#[tokio::test]
async fn test_online_delivery_pushes_frame() {
    let h = common::harness();
    let eve = common::register_user(&h.store, "eve");
    let dave = common::register_user(&h.store, "dave");
    common::login(&h.auth, &eve, "device-e");
    common::login(&h.auth, &dave, "device-d");

    let mut rx = h.registry.register(&dave.user.id, "device-d", "socket-1");

    let outcome = h
        .relay
        .send(&eve.user.id, &dave.user.id, "aGVsbG8=", MessageType::PreKeySignalMessage)
        .unwrap();
    assert!(outcome.delivered);

    let frame = rx.recv().await.expect("frame pushed");
    let envelope = protocol::decode_message(&frame.data).unwrap();
    match envelope.payload {
        protocol::MessagePayload::NewMessage { message } => {
            assert_eq!(message.sender_id, eve.user.id);
            assert_eq!(message.ciphertext, "aGVsbG8=");
            assert_eq!(message.message_type, MessageType::PreKeySignalMessage);
            assert!(!message.timestamp.is_empty());
        }
        other => panic!("expected NewMessage, got {other:?}"),
    }

    assert_eq!(h.store.queue_depth(&dave.user.id).unwrap(), 0);
}

/// Two interleaved drains return disjoint sets covering the whole queue.
#[test]
fn test_interleaved_drains_are_disjoint() {
    let h = common::harness();
    let eve = common::register_user(&h.store, "eve");
    let dave = common::register_user(&h.store, "dave");
    common::login(&h.auth, &eve, "device-e");
    common::login(&h.auth, &dave, "device-d");

    for i in 0..10 {
        let ciphertext = STANDARD.encode(format!("msg-{i}"));
        h.relay
            .send(&eve.user.id, &dave.user.id, &ciphertext, MessageType::SignalMessage)
            .unwrap();
    }

    let first = h.relay.fetch_offline(&dave.user.id, 6).unwrap();
    let second = h.relay.fetch_offline(&dave.user.id, 6).unwrap();
    assert_eq!(first.len(), 6);
    assert_eq!(second.len(), 4);

    let mut ids: Vec<&str> = first.iter().chain(second.iter()).map(|m| m.id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 10, "no message may appear in both drains");
}

/// Acked messages disappear; acks are scoped to the caller's own queue.
#[test]
fn test_ack_delete_after_peek_equivalent_flow() {
    let h = common::harness();
    let eve = common::register_user(&h.store, "eve");
    let dave = common::register_user(&h.store, "dave");
    common::login(&h.auth, &eve, "device-e");
    common::login(&h.auth, &dave, "device-d");

    let m1 = h
        .relay
        .send(&eve.user.id, &dave.user.id, "bTE=", MessageType::SignalMessage)
        .unwrap()
        .message_id
        .unwrap();
    let m2 = h
        .relay
        .send(&eve.user.id, &dave.user.id, "bTI=", MessageType::SignalMessage)
        .unwrap()
        .message_id
        .unwrap();

    // Sender cannot ack the recipient's rows.
    assert_eq!(h.relay.ack_delete(&eve.user.id, &[m1.clone()]).unwrap(), 0);

    assert_eq!(
        h.relay
            .ack_delete(&dave.user.id, &[m1.clone(), m2.clone()])
            .unwrap(),
        2
    );
    assert!(h.relay.fetch_offline(&dave.user.id, 10).unwrap().is_empty());

    // Acking already-gone rows removes nothing.
    assert_eq!(h.relay.ack_delete(&dave.user.id, &[m1, m2]).unwrap(), 0);
}

/// Online takeover race: the new socket survives the old socket's late
/// disconnect, and delivery reaches the new socket.
#[tokio::test]
async fn test_online_takeover_race() {
    let h = common::harness();
    let frank = common::register_user(&h.store, "frank");
    let eve = common::register_user(&h.store, "eve");
    common::login(&h.auth, &frank, "device-f");
    common::login(&h.auth, &eve, "device-e");

    // frank connects on S1, then a new handshake arrives and replaces it.
    let mut rx_s1 = h.registry.register(&frank.user.id, "device-f", "socket-1");
    let mut rx_s2 = h.registry.register(&frank.user.id, "device-f", "socket-2");

    // S1's channel closed: that socket task would now shut down...
    assert!(rx_s1.recv().await.is_none());
    // ...and its late disconnect must not evict S2.
    assert!(!h.registry.unregister(&frank.user.id, "device-f", "socket-1"));
    assert!(h.registry.is_online(&frank.user.id, "device-f"));

    let outcome = h
        .relay
        .send(&eve.user.id, &frank.user.id, "cGluZw==", MessageType::SignalMessage)
        .unwrap();
    assert!(outcome.delivered);
    assert!(rx_s2.recv().await.is_some());
}
