//! In-memory doubles for peer connections, transports and remote tracks.
//!
//! They record what the coordinator does to them and let tests drive
//! callbacks by hand, so negotiation can be exercised without ICE.

use crate::error::{Result, SfuError};
use crate::message::SignalMessage;
use crate::peer::{
    ConnectionState, IceCandidate, InboundTrack, PeerConnection, PeerFactory, SessionDescription,
    TrackHandler, IceCandidateHandler, StateChangeHandler,
};
use crate::room::Room;
use crate::track::{RemoteTrack, TrackKind};
use crate::transport::SignalTransport;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

type SharedHandler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct FakePeerState {
    connection: ConnectionState,
    senders: Vec<String>,
    receivers: Vec<InboundTrack>,
    offer_attempts: u64,
    offers_created: u64,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    keyframes: Vec<u32>,
    close_count: u32,
    offer_failure: Option<fn() -> SfuError>,
    fail_remote: bool,
}

#[derive(Default)]
struct FakeHandlers {
    track: Option<SharedHandler<Arc<dyn RemoteTrack>>>,
    candidate: Option<SharedHandler<IceCandidate>>,
    state: Option<SharedHandler<ConnectionState>>,
}

/// Peer connection that only tracks state
pub struct FakePeer {
    state: Mutex<FakePeerState>,
    handlers: Mutex<FakeHandlers>,
}

impl FakePeer {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakePeerState {
                connection: ConnectionState::New,
                senders: Vec::new(),
                receivers: Vec::new(),
                offer_attempts: 0,
                offers_created: 0,
                local: None,
                remote: None,
                candidates: Vec::new(),
                keyframes: Vec::new(),
                close_count: 0,
                offer_failure: None,
                fail_remote: false,
            }),
            handlers: Mutex::new(FakeHandlers::default()),
        })
    }

    /// Make `create_offer` fail with a negotiation error until reset.
    pub fn set_fail_offers(&self, fail: bool) {
        let failure: fn() -> SfuError = || SfuError::Negotiation("offer creation failed".to_string());
        self.state.lock().offer_failure = fail.then_some(failure);
    }

    /// Make `create_offer` fail with the error built by `failure`.
    pub fn set_offer_failure(&self, failure: fn() -> SfuError) {
        self.state.lock().offer_failure = Some(failure);
    }

    /// Make `set_remote_description` fail until reset.
    pub fn set_fail_remote_description(&self, fail: bool) {
        self.state.lock().fail_remote = fail;
    }

    /// Change the connection state without notifying anyone.
    pub fn set_connection_state(&self, state: ConnectionState) {
        self.state.lock().connection = state;
    }

    /// Change the connection state and run the registered handler.
    pub async fn transition(&self, state: ConnectionState) {
        self.set_connection_state(state);
        let handler = self.handlers.lock().state.clone();
        if let Some(handler) = handler {
            handler(state).await;
        }
    }

    /// Start receiving `remote` from the client and run the track handler.
    pub async fn publish(&self, remote: Arc<dyn RemoteTrack>) {
        self.state.lock().receivers.push(InboundTrack {
            track_id: remote.id(),
            ssrc: remote.ssrc(),
        });
        let handler = self.handlers.lock().track.clone();
        if let Some(handler) = handler {
            handler(remote).await;
        }
    }

    /// Record an inbound track without running the track handler.
    pub fn add_receiver(&self, track_id: &str, ssrc: u32) {
        self.state.lock().receivers.push(InboundTrack {
            track_id: track_id.to_string(),
            ssrc,
        });
    }

    /// Emit a locally gathered candidate.
    pub async fn gather(&self, candidate: IceCandidate) {
        let handler = self.handlers.lock().candidate.clone();
        if let Some(handler) = handler {
            handler(candidate).await;
        }
    }

    #[must_use]
    pub fn sender_ids(&self) -> Vec<String> {
        let mut ids = self.state.lock().senders.clone();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn offers_created(&self) -> u64 {
        self.state.lock().offers_created
    }

    /// Calls to `create_offer`, including failed ones.
    #[must_use]
    pub fn offer_attempts(&self) -> u64 {
        self.state.lock().offer_attempts
    }

    #[must_use]
    pub fn close_count(&self) -> u32 {
        self.state.lock().close_count
    }

    #[must_use]
    pub fn keyframe_requests(&self) -> Vec<u32> {
        self.state.lock().keyframes.clone()
    }

    #[must_use]
    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    #[must_use]
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    #[must_use]
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }
}

fn closed_error() -> SfuError {
    SfuError::ConnectionClosed
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        state.offer_attempts += 1;
        if state.connection == ConnectionState::Closed {
            return Err(closed_error());
        }
        if let Some(failure) = state.offer_failure {
            return Err(failure());
        }
        state.offers_created += 1;
        Ok(SessionDescription::offer(format!("fake-offer-{}", state.offers_created)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.state.lock();
        if state.remote.is_none() {
            return Err(SfuError::Negotiation("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer("fake-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.state.lock().local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_remote {
            return Err(SfuError::Negotiation("remote description rejected".to_string()));
        }
        state.remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.state.lock().candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<()> {
        let mut state = self.state.lock();
        if state.connection == ConnectionState::Closed {
            return Err(closed_error());
        }
        let id = track.id().to_string();
        if !state.senders.contains(&id) {
            state.senders.push(id);
        }
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        self.state.lock().senders.retain(|id| id != track_id);
        Ok(())
    }

    async fn senders(&self) -> Vec<String> {
        self.state.lock().senders.clone()
    }

    async fn receivers(&self) -> Vec<InboundTrack> {
        self.state.lock().receivers.clone()
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    async fn request_keyframe(&self, media_ssrc: u32) -> Result<()> {
        self.state.lock().keyframes.push(media_ssrc);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.close_count += 1;
        state.connection = ConnectionState::Closed;
        Ok(())
    }

    fn on_track(&self, handler: TrackHandler) {
        self.handlers.lock().track = Some(Arc::from(handler));
    }

    fn on_ice_candidate(&self, handler: IceCandidateHandler) {
        self.handlers.lock().candidate = Some(Arc::from(handler));
    }

    fn on_connection_state_change(&self, handler: StateChangeHandler) {
        self.handlers.lock().state = Some(Arc::from(handler));
    }
}

/// Hands out [`FakePeer`]s and keeps them for inspection
#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    fail: AtomicBool,
}

impl FakePeerFactory {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }

    #[must_use]
    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().clone()
    }

    #[must_use]
    pub fn last(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create_peer(&self) -> Result<Arc<dyn PeerConnection>> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(SfuError::Transport("peer connection setup failed".to_string()));
        }
        let peer = FakePeer::new();
        self.peers.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

/// Signaling transport backed by in-memory queues
pub struct FakeTransport {
    sent: Mutex<Vec<SignalMessage>>,
    inbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    closed: CancellationToken,
    fail_sends: AtomicBool,
}

impl FakeTransport {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            closed: CancellationToken::new(),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// Queue a message as if the client had sent it.
    pub fn push(&self, message: &SignalMessage) {
        if let Ok(text) = message.encode() {
            self.push_raw(text);
        }
    }

    /// Queue a raw frame as if the client had sent it.
    pub fn push_raw(&self, text: impl Into<String>) {
        // receiver lives as long as self
        let _ = self.inbound_tx.send(text.into());
    }

    /// Simulate the client hanging up.
    pub fn hang_up(&self) {
        self.closed.cancel();
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }

    #[must_use]
    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().clone()
    }

    #[must_use]
    pub fn sent_of_kind(&self, kind: &str) -> Vec<SignalMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.kind() == kind)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn offers(&self) -> usize {
        self.sent_of_kind("offer").len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl SignalTransport for FakeTransport {
    async fn send(&self, message: &SignalMessage) -> Result<()> {
        if self.is_closed() {
            return Err(SfuError::Transport("transport closed".to_string()));
        }
        if self.fail_sends.load(Ordering::Relaxed) {
            return Err(SfuError::Transport("write failed".to_string()));
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }

    async fn read_message(&self) -> Option<Result<String>> {
        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => None,
            text = inbound.recv() => text.map(Ok),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

static NEXT_SSRC: AtomicU32 = AtomicU32::new(1000);

/// Remote track fed through a channel; it ends when the sender is dropped
pub struct FakeRemoteTrack {
    id: String,
    kind: TrackKind,
    ssrc: u32,
    packets: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
}

impl FakeRemoteTrack {
    #[must_use]
    pub fn new(id: &str, kind: TrackKind) -> (Arc<Self>, mpsc::Sender<Packet>) {
        let (tx, rx) = mpsc::channel(64);
        let track = Arc::new(Self {
            id: id.to_string(),
            kind,
            ssrc: NEXT_SSRC.fetch_add(1, Ordering::Relaxed),
            packets: tokio::sync::Mutex::new(rx),
        });
        (track, tx)
    }
}

#[async_trait]
impl RemoteTrack for FakeRemoteTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn stream_id(&self) -> String {
        format!("stream-{}", self.id)
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        let (mime_type, clock_rate, channels) = match self.kind {
            TrackKind::Audio => ("audio/opus", 48000, 2),
            TrackKind::Video => ("video/VP8", 90000, 0),
        };
        RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            clock_rate,
            channels,
            ..Default::default()
        }
    }

    async fn read(&self, _buf: &mut [u8]) -> Result<Packet> {
        self.packets
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| SfuError::Transport("remote track ended".to_string()))
    }
}

/// Answer every outstanding server offer in `room` until none is left.
/// Returns how many answers were applied.
pub async fn answer_outstanding(room: &Arc<Room>) -> usize {
    let mut answered = 0;
    for _ in 0..64 {
        let pending: Vec<_> = room
            .participants()
            .into_iter()
            .filter(|session| session.awaiting_answer())
            .collect();
        if pending.is_empty() {
            break;
        }
        for session in pending {
            if room
                .apply_answer(&session, SessionDescription::answer("fake-answer"))
                .await
                .is_ok()
            {
                answered += 1;
            }
        }
    }
    answered
}
