//! Shared helpers for the roomcast-sfu integration tests

#![allow(dead_code)]

use roomcast_sfu::testing::{FakePeer, FakeTransport};
use roomcast_sfu::{ParticipantSession, PeerId};
use std::sync::Arc;
use std::time::Duration;

pub fn participant(name: &str) -> (Arc<ParticipantSession>, Arc<FakePeer>, Arc<FakeTransport>) {
    let peer = FakePeer::new();
    let transport = FakeTransport::new();
    let session = ParticipantSession::new(PeerId::new(name), peer.clone(), transport.clone());
    (session, peer, transport)
}

/// Poll `condition` until it holds; panics after about five seconds.
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}
