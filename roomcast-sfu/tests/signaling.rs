//! Integration tests for the per-socket signaling loop
//!
//! Run with: cargo test -p roomcast-sfu --test signaling

mod common;

use common::eventually;
use roomcast_sfu::testing::{FakePeerFactory, FakeTransport};
use roomcast_sfu::{
    IceCandidate, JoinPayload, NegotiationState, ParticipantInfo, PeerId, RoomDirectory, RoomId,
    SdpPayload, SdpType, SfuConfig, SignalMessage, SignalingConnection,
};
use std::sync::Arc;
use tokio::task::JoinHandle;

struct Client {
    transport: Arc<FakeTransport>,
    handle: JoinHandle<()>,
}

fn connect(
    directory: &Arc<RoomDirectory>,
    factory: &Arc<FakePeerFactory>,
    room_id: &RoomId,
    peer_id: PeerId,
    auto_join: bool,
) -> Client {
    let transport = FakeTransport::new();
    let connection = SignalingConnection::new(
        Arc::clone(directory),
        factory.clone(),
        room_id.clone(),
        peer_id,
        transport.clone(),
    );
    let handle = tokio::spawn(connection.run(auto_join));
    Client { transport, handle }
}

fn info(user: &str) -> ParticipantInfo {
    ParticipantInfo {
        user_id: PeerId::new(user),
        tracks: Vec::new(),
    }
}

#[tokio::test]
async fn test_join_negotiate_and_leave() {
    let directory = RoomDirectory::new(SfuConfig::default());
    let factory = FakePeerFactory::new();
    let room_id = RoomId::new("lobby");
    let alice = PeerId::new("alice");

    let client = connect(&directory, &factory, &room_id, alice.clone(), false);
    let tx = client.transport.clone();
    tx.push(&SignalMessage::Join(JoinPayload::default()));
    eventually("server offer", || tx.offers() == 1).await;

    let acks = tx.sent_of_kind("join");
    assert_eq!(
        acks,
        vec![SignalMessage::Join(JoinPayload {
            room_id: Some(room_id.clone()),
            user_id: Some(alice.clone()),
        })]
    );

    // garbage and unknown events are dropped without closing the socket
    tx.push_raw("not json");
    tx.push_raw(r#"{"type":"dance","data":{}}"#);
    tx.push(&SignalMessage::Answer(SdpPayload {
        sdp_type: Some(SdpType::Answer),
        sdp: "v=0 answer".to_string(),
    }));

    let room = directory.get(&room_id).unwrap();
    eventually("answer applied", || {
        room.participant(&alice)
            .is_some_and(|s| s.negotiation_state() == NegotiationState::Stable)
    })
    .await;

    let peer = factory.last().unwrap();
    tx.push(&SignalMessage::Candidate(IceCandidate::new("")));
    tx.push(&SignalMessage::Candidate(IceCandidate::new(
        "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host",
    )));
    eventually("candidate applied", || peer.candidates().len() == 1).await;
    assert!(!peer.candidates()[0].candidate.is_empty());

    tx.push(&SignalMessage::Close);
    client.handle.await.unwrap();

    assert!(tx.is_closed());
    assert_eq!(peer.close_count(), 1);
    assert!(directory.get(&room_id).is_none());
}

#[tokio::test]
async fn test_access_broadcast_reaches_watchers() {
    let directory = RoomDirectory::new(SfuConfig::default());
    let factory = FakePeerFactory::new();
    let room_id = RoomId::new("watchers");

    let alice = connect(&directory, &factory, &room_id, PeerId::new("alice"), false);
    let bob = connect(&directory, &factory, &room_id, PeerId::new("bob"), false);
    alice.transport.push(&SignalMessage::Join(JoinPayload::default()));
    eventually("alice joined", || alice.transport.offers() == 1).await;
    bob.transport.push(&SignalMessage::Join(JoinPayload::default()));

    let expected = SignalMessage::Access(vec![info("alice"), info("bob")]);
    eventually("roster with both", || {
        alice.transport.sent_of_kind("access").last() == Some(&expected)
    })
    .await;

    bob.transport.hang_up();
    bob.handle.await.unwrap();
    let expected = SignalMessage::Access(vec![info("alice")]);
    eventually("roster without bob", || {
        alice.transport.sent_of_kind("access").last() == Some(&expected)
    })
    .await;
    assert_eq!(directory.stats().lobby_connections, 1);
}

#[tokio::test]
async fn test_viewer_socket_joins_automatically() {
    let directory = RoomDirectory::new(SfuConfig::default());
    let factory = FakePeerFactory::new();
    let room_id = RoomId::new("stage");
    let viewer = PeerId::viewer("alice");

    let client = connect(&directory, &factory, &room_id, viewer.clone(), true);
    let tx = client.transport.clone();
    eventually("viewer offer", || tx.offers() == 1).await;

    assert_eq!(
        tx.sent_of_kind("join"),
        vec![SignalMessage::Join(JoinPayload {
            room_id: Some(room_id.clone()),
            user_id: Some(PeerId::new("alice_viewer")),
        })]
    );
    let room = directory.get(&room_id).unwrap();
    assert!(room.participant(&viewer).is_some());
}

#[tokio::test]
async fn test_client_offer_without_join_is_answered() {
    let directory = RoomDirectory::new(SfuConfig::default());
    let factory = FakePeerFactory::new();
    let room_id = RoomId::new("direct");

    let client = connect(&directory, &factory, &room_id, PeerId::new("carol"), false);
    let tx = client.transport.clone();
    tx.push(&SignalMessage::Offer(SdpPayload {
        sdp_type: Some(SdpType::Offer),
        sdp: "v=0 client".to_string(),
    }));
    eventually("answer sent", || tx.sent_of_kind("answer").len() == 1).await;

    let peer = factory.last().unwrap();
    assert_eq!(peer.remote_description().unwrap().sdp, "v=0 client");
    assert_eq!(tx.offers(), 0);
}

#[tokio::test]
async fn test_refused_peer_keeps_socket_open() {
    let directory = RoomDirectory::new(SfuConfig::default());
    let factory = FakePeerFactory::new();
    factory.set_fail(true);
    let room_id = RoomId::new("broken");

    let client = connect(&directory, &factory, &room_id, PeerId::new("dave"), false);
    let tx = client.transport.clone();
    tx.push(&SignalMessage::Join(JoinPayload::default()));
    tx.push(&SignalMessage::Candidate(IceCandidate::new("candidate:1")));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(!tx.is_closed());
    assert_eq!(directory.get(&room_id).unwrap().participant_count(), 0);

    tx.hang_up();
    client.handle.await.unwrap();
    assert!(directory.get(&room_id).is_none());
}

#[tokio::test]
async fn test_repeated_join_keeps_socket_open() {
    let directory = RoomDirectory::new(SfuConfig::default());
    let factory = FakePeerFactory::new();
    let room_id = RoomId::new("rejoin");
    let alice = PeerId::new("alice");

    let client = connect(&directory, &factory, &room_id, alice.clone(), false);
    let tx = client.transport.clone();
    tx.push(&SignalMessage::Join(JoinPayload::default()));
    eventually("first offer", || tx.offers() == 1).await;
    let room = directory.get(&room_id).unwrap();
    let first = room.participant(&alice).unwrap();

    tx.push(&SignalMessage::Join(JoinPayload::default()));
    eventually("offer on the new session", || tx.offers() == 2).await;

    assert!(!tx.is_closed());
    assert!(!client.handle.is_finished());
    assert_eq!(tx.sent_of_kind("join").len(), 2);
    assert!(!tx.sent().contains(&SignalMessage::Close));

    let peers = factory.peers();
    assert_eq!(peers.len(), 2);
    assert_eq!(peers[0].close_count(), 1);
    assert_eq!(peers[1].close_count(), 0);

    let current = room.participant(&alice).unwrap();
    assert_ne!(current.id, first.id);
    assert_eq!(room.participant_count(), 1);
    assert!(directory.get(&room_id).is_some());

    tx.hang_up();
    client.handle.await.unwrap();
    assert!(directory.get(&room_id).is_none());
}

#[tokio::test]
async fn test_viewer_join_after_auto_join_keeps_socket_open() {
    let directory = RoomDirectory::new(SfuConfig::default());
    let factory = FakePeerFactory::new();
    let room_id = RoomId::new("stage-rejoin");
    let viewer = PeerId::viewer("bob");

    let client = connect(&directory, &factory, &room_id, viewer.clone(), true);
    let tx = client.transport.clone();
    eventually("viewer offer", || tx.offers() == 1).await;

    tx.push(&SignalMessage::Join(JoinPayload::default()));
    eventually("second viewer offer", || tx.offers() == 2).await;

    assert!(!tx.is_closed());
    let room = directory.get(&room_id).unwrap();
    assert!(room.participant(&viewer).is_some());
}
