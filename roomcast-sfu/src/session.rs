//! Participant sessions
//!
//! A session binds one participant identity to its signaling transport and
//! peer connection, and carries the negotiation flags that keep at most one
//! server offer outstanding per participant.

use crate::error::Result;
use crate::message::SignalMessage;
use crate::peer::{ConnectionState, PeerConnection};
use crate::transport::SignalTransport;
use crate::types::{PeerId, SessionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Observable negotiation state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    /// Nothing negotiated yet
    Idle,
    /// A server offer awaits its answer
    OfferSent,
    /// Last exchange completed
    Stable,
    /// Terminal; the session is being torn down
    Failed,
}

#[derive(Debug, Default)]
struct Negotiation {
    in_flight: bool,
    requested: bool,
    completed: bool,
    /// A server offer went out and its answer has not been applied
    awaiting_answer: bool,
    /// An attempt failed after the last completed exchange
    stale: bool,
    offers_sent: u64,
}

pub struct ParticipantSession {
    pub id: SessionId,
    pub peer_id: PeerId,
    peer: Arc<dyn PeerConnection>,
    transport: Arc<dyn SignalTransport>,
    negotiation: Mutex<Negotiation>,
    closed: AtomicBool,
}

impl ParticipantSession {
    pub fn new(
        peer_id: PeerId,
        peer: Arc<dyn PeerConnection>,
        transport: Arc<dyn SignalTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::generate(),
            peer_id,
            peer,
            transport,
            negotiation: Mutex::new(Negotiation::default()),
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn SignalTransport> {
        &self.transport
    }

    #[must_use]
    pub fn negotiation_state(&self) -> NegotiationState {
        if self.is_closed() {
            return NegotiationState::Failed;
        }
        let negotiation = self.negotiation.lock();
        if negotiation.in_flight {
            NegotiationState::OfferSent
        } else if negotiation.completed {
            NegotiationState::Stable
        } else {
            NegotiationState::Idle
        }
    }

    #[must_use]
    pub fn is_negotiating(&self) -> bool {
        self.negotiation.lock().in_flight
    }

    /// Whether a server offer was sent and still waits for its answer.
    /// Unlike [`Self::is_negotiating`] this stays false while a pass holds
    /// the slot but has not sent anything yet.
    #[must_use]
    pub fn awaiting_answer(&self) -> bool {
        self.negotiation.lock().awaiting_answer
    }

    /// Total offers sent to this participant.
    #[must_use]
    pub fn offers_sent(&self) -> u64 {
        self.negotiation.lock().offers_sent
    }

    /// Whether an offer is due even with no sender changes: nothing was
    /// negotiated yet, or the last attempt broke off.
    #[must_use]
    pub fn needs_offer(&self) -> bool {
        let negotiation = self.negotiation.lock();
        !negotiation.completed || negotiation.stale
    }

    /// Claim the right to start an offer. When an offer is already
    /// outstanding the request is remembered and `false` is returned.
    pub(crate) fn begin_negotiation(&self) -> bool {
        let mut negotiation = self.negotiation.lock();
        if negotiation.in_flight {
            negotiation.requested = true;
            return false;
        }
        negotiation.in_flight = true;
        true
    }

    /// Claim the negotiation slot for a client-initiated offer, without
    /// queueing a request when it is taken.
    pub(crate) fn begin_remote_negotiation(&self) -> bool {
        let mut negotiation = self.negotiation.lock();
        if negotiation.in_flight {
            return false;
        }
        negotiation.in_flight = true;
        true
    }

    pub(crate) fn record_offer_sent(&self) {
        let mut negotiation = self.negotiation.lock();
        negotiation.offers_sent += 1;
        negotiation.awaiting_answer = true;
    }

    /// Release the slot after an exchange finished. Returns whether a sync
    /// was requested while it was held.
    pub(crate) fn finish_negotiation(&self) -> bool {
        let mut negotiation = self.negotiation.lock();
        negotiation.in_flight = false;
        negotiation.awaiting_answer = false;
        negotiation.completed = true;
        negotiation.stale = false;
        std::mem::take(&mut negotiation.requested)
    }

    /// Release the slot after a failed attempt.
    pub(crate) fn abort_negotiation(&self) {
        let mut negotiation = self.negotiation.lock();
        negotiation.in_flight = false;
        negotiation.awaiting_answer = false;
        negotiation.requested = false;
        negotiation.stale = true;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closed by us, or its peer connection reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.is_closed() || self.peer.connection_state().is_terminal()
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.peer.connection_state()
    }

    pub async fn send(&self, message: &SignalMessage) -> Result<()> {
        self.transport.send(message).await
    }

    /// Close the peer connection and the transport. Only the first call
    /// has any effect.
    pub async fn close(&self) {
        if self.close_peer().await {
            self.transport.close().await;
        }
    }

    /// Close the peer connection but leave the transport open, for a socket
    /// that goes on with a new session. Returns `false` if the session was
    /// already closed.
    pub async fn close_peer(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(peer_id = %self.peer_id, session_id = %self.id, "Closing participant session");
        if let Err(e) = self.peer.close().await {
            warn!(peer_id = %self.peer_id, error = %e, "Failed to close peer connection");
        }
        true
    }

    /// Tell the client it has been removed, then close.
    pub async fn evict(&self) {
        if !self.is_closed() {
            if let Err(e) = self.send(&SignalMessage::Close).await {
                debug!(peer_id = %self.peer_id, error = %e, "Close notice not delivered");
            }
        }
        self.close().await;
    }
}

impl Drop for ParticipantSession {
    fn drop(&mut self) {
        debug!(peer_id = %self.peer_id, session_id = %self.id, "Participant session dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePeer, FakeTransport};

    fn session() -> (Arc<ParticipantSession>, Arc<FakePeer>, Arc<FakeTransport>) {
        let peer = FakePeer::new();
        let transport = FakeTransport::new();
        let session = ParticipantSession::new(PeerId::new("alice"), peer.clone(), transport.clone());
        (session, peer, transport)
    }

    #[test]
    fn test_negotiation_slot_is_exclusive() {
        let (session, _, _) = session();
        assert_eq!(session.negotiation_state(), NegotiationState::Idle);

        assert!(session.begin_negotiation());
        assert_eq!(session.negotiation_state(), NegotiationState::OfferSent);
        assert!(!session.begin_negotiation());
        assert!(!session.begin_remote_negotiation());

        // the blocked attempt was remembered
        assert!(session.finish_negotiation());
        assert_eq!(session.negotiation_state(), NegotiationState::Stable);
        assert!(!session.finish_negotiation());
    }

    #[test]
    fn test_abort_clears_request() {
        let (session, _, _) = session();
        assert!(session.begin_negotiation());
        assert!(!session.begin_negotiation());
        session.abort_negotiation();
        assert!(!session.is_negotiating());
        assert!(session.needs_offer());
        assert!(session.begin_negotiation());
        assert!(!session.finish_negotiation());
        assert!(!session.needs_offer());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, peer, transport) = session();
        session.close().await;
        session.close().await;
        session.evict().await;

        assert_eq!(peer.close_count(), 1);
        assert!(transport.is_closed());
        assert!(transport.sent().is_empty());
        assert_eq!(session.negotiation_state(), NegotiationState::Failed);
    }

    #[test]
    fn test_awaiting_answer_follows_sent_offer() {
        let (session, _, _) = session();
        assert!(session.begin_negotiation());
        assert!(!session.awaiting_answer());

        session.record_offer_sent();
        assert!(session.awaiting_answer());
        session.finish_negotiation();
        assert!(!session.awaiting_answer());

        assert!(session.begin_negotiation());
        session.record_offer_sent();
        session.abort_negotiation();
        assert!(!session.awaiting_answer());
    }

    #[tokio::test]
    async fn test_close_peer_leaves_transport_open() {
        let (session, peer, transport) = session();
        assert!(session.close_peer().await);
        assert!(!session.close_peer().await);
        session.close().await;

        assert_eq!(peer.close_count(), 1);
        assert!(!transport.is_closed());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_evict_sends_close_notice() {
        let (session, peer, transport) = session();
        session.evict().await;
        assert_eq!(transport.sent(), vec![SignalMessage::Close]);
        assert_eq!(peer.close_count(), 1);
    }
}
