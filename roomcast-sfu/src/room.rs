//! Room state
//!
//! A room owns its participants, the registry of forwarded tracks and the
//! lobby of signaling sockets watching it. All three live behind one mutex
//! that is only held to read or mutate the maps, never across I/O.

use crate::config::SfuConfig;
use crate::directory::RoomDirectory;
use crate::error::{Result, SfuError};
use crate::message::{ParticipantInfo, SignalMessage};
use crate::peer::ConnectionState;
use crate::relay::IngestRelay;
use crate::retry::RetryHandle;
use crate::session::{NegotiationState, ParticipantSession};
use crate::track::{ForwardTrack, TrackKind, TrackStats};
use crate::transport::SignalTransport;
use crate::types::{ConnectionId, PeerId, RoomId, SessionId, TrackId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
struct RoomState {
    participants: HashMap<PeerId, Arc<ParticipantSession>>,
    tracks: HashMap<TrackId, Arc<ForwardTrack>>,
    lobby: HashMap<ConnectionId, Arc<dyn SignalTransport>>,
}

pub struct Room {
    pub id: RoomId,
    pub(crate) config: Arc<SfuConfig>,
    state: Mutex<RoomState>,
    pub(crate) retry: RetryHandle,
    directory: Weak<RoomDirectory>,
    shutdown: CancellationToken,
    created_at: DateTime<Utc>,
}

impl Room {
    pub(crate) fn new(
        id: RoomId,
        config: Arc<SfuConfig>,
        retry: RetryHandle,
        directory: Weak<RoomDirectory>,
    ) -> Arc<Self> {
        let room = Arc::new(Self {
            id,
            config,
            state: Mutex::new(RoomState::default()),
            retry,
            directory,
            shutdown: CancellationToken::new(),
            created_at: Utc::now(),
        });
        room.start_keyframe_ticker();
        info!(room_id = %room.id, "Room created");
        room
    }

    fn start_keyframe_ticker(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let period = self.config.keyframe_interval();
        let room_id = self.id.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(room) = weak.upgrade() else {
                    break;
                };
                room.dispatch_keyframe().await;
            }
            debug!(room_id = %room_id, "Keyframe ticker stopped");
        });
    }

    #[must_use]
    pub fn participant(&self, peer_id: &PeerId) -> Option<Arc<ParticipantSession>> {
        self.state.lock().participants.get(peer_id).cloned()
    }

    #[must_use]
    pub fn participants(&self) -> Vec<Arc<ParticipantSession>> {
        self.state.lock().participants.values().cloned().collect()
    }

    #[must_use]
    pub fn participant_count(&self) -> usize {
        self.state.lock().participants.len()
    }

    #[must_use]
    pub fn tracks(&self) -> Vec<Arc<ForwardTrack>> {
        self.state.lock().tracks.values().cloned().collect()
    }

    #[must_use]
    pub fn track(&self, track_id: &TrackId) -> Option<Arc<ForwardTrack>> {
        self.state.lock().tracks.get(track_id).cloned()
    }

    #[must_use]
    pub fn track_count(&self) -> usize {
        self.state.lock().tracks.len()
    }

    #[must_use]
    pub fn lobby_count(&self) -> usize {
        self.state.lock().lobby.len()
    }

    /// No participants, no forwarded tracks and nobody watching.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.participants.is_empty() && state.tracks.is_empty() && state.lobby.is_empty()
    }

    /// Whether the room has left the directory and stopped its tasks.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Register `session`, replacing any session with the same identity.
    /// The replaced session is returned and must be evicted by the caller.
    pub(crate) fn admit(
        self: &Arc<Self>,
        session: Arc<ParticipantSession>,
    ) -> Result<Option<Arc<ParticipantSession>>> {
        let evicted = {
            let mut state = self.state.lock();
            let limit = self.config.max_participants_per_room;
            if limit > 0
                && !state.participants.contains_key(&session.peer_id)
                && state.participants.len() >= limit
            {
                return Err(SfuError::RoomLimit(format!(
                    "room {} is full ({limit} participants)",
                    self.id
                )));
            }
            state
                .participants
                .insert(session.peer_id.clone(), Arc::clone(&session))
        };

        self.wire_events(&session);
        info!(
            room_id = %self.id,
            peer_id = %session.peer_id,
            session_id = %session.id,
            replaced = evicted.is_some(),
            "Participant admitted"
        );
        Ok(evicted)
    }

    /// Unregister `session` if it is still the registered session of its
    /// identity.
    pub(crate) fn detach(&self, session: &ParticipantSession) -> bool {
        let mut state = self.state.lock();
        let registered = state
            .participants
            .get(&session.peer_id)
            .is_some_and(|current| current.id == session.id);
        if registered {
            state.participants.remove(&session.peer_id);
        }
        registered
    }

    fn detach_by_identity(&self, peer_id: &PeerId) -> Option<Arc<ParticipantSession>> {
        self.state.lock().participants.remove(peer_id)
    }

    /// Remove a participant on request, notifying its client. Returns the
    /// removed session, or `None` when the identity is not present.
    pub async fn remove_participant(
        self: &Arc<Self>,
        peer_id: &PeerId,
    ) -> Option<Arc<ParticipantSession>> {
        let session = self.detach_by_identity(peer_id)?;
        info!(room_id = %self.id, peer_id = %peer_id, "Participant removed");
        session.evict().await;
        self.broadcast_access().await;
        self.sync().await;
        self.request_reclaim();
        Some(session)
    }

    /// Tear down a session whose connection or socket is gone.
    pub async fn drop_session(self: &Arc<Self>, session: &Arc<ParticipantSession>) {
        let removed = self.detach(session);
        session.close().await;
        if removed {
            info!(
                room_id = %self.id,
                peer_id = %session.peer_id,
                session_id = %session.id,
                "Participant left"
            );
            self.broadcast_access().await;
            self.sync().await;
        }
        self.request_reclaim();
    }

    /// Publish a forwarded track to the room and renegotiate everyone.
    /// A track with the same id replaces the previous entry.
    pub async fn add_track(self: &Arc<Self>, track: Arc<ForwardTrack>) {
        let replaced = self
            .state
            .lock()
            .tracks
            .insert(track.id.clone(), Arc::clone(&track));
        info!(
            room_id = %self.id,
            track_id = %track.id,
            publisher = %track.publisher,
            replaced = replaced.is_some(),
            "Track published"
        );

        if let Some(previous) = replaced {
            // senders under this id are still bound to the old local track
            for session in self.participants() {
                if let Err(e) = session.peer().remove_track(previous.id.as_str()).await {
                    debug!(
                        room_id = %self.id,
                        peer_id = %session.peer_id,
                        track_id = %previous.id,
                        error = %e,
                        "Failed to detach replaced track"
                    );
                }
            }
        }
        self.sync().await;
    }

    /// Withdraw `track` if it is still the registered entry for its id.
    pub async fn remove_track(self: &Arc<Self>, track: &Arc<ForwardTrack>) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let registered = state
                .tracks
                .get(&track.id)
                .is_some_and(|current| Arc::ptr_eq(current, track));
            if registered {
                state.tracks.remove(&track.id);
            }
            registered
        };
        if removed {
            info!(room_id = %self.id, track_id = %track.id, "Track withdrawn");
        }
        self.sync().await;
        removed
    }

    /// Ask every publisher for a keyframe on each of its inbound tracks.
    pub async fn dispatch_keyframe(&self) {
        for session in self.participants() {
            if session.is_terminal() {
                continue;
            }
            for inbound in session.peer().receivers().await {
                if inbound.ssrc == 0 {
                    continue;
                }
                if let Err(e) = session.peer().request_keyframe(inbound.ssrc).await {
                    debug!(
                        room_id = %self.id,
                        peer_id = %session.peer_id,
                        ssrc = inbound.ssrc,
                        error = %e,
                        "Keyframe request failed"
                    );
                }
            }
        }
    }

    pub(crate) fn register_lobby(&self, connection_id: ConnectionId, transport: Arc<dyn SignalTransport>) {
        self.state.lock().lobby.insert(connection_id, transport);
    }

    pub(crate) fn unregister_lobby(&self, connection_id: &ConnectionId) -> bool {
        self.state.lock().lobby.remove(connection_id).is_some()
    }

    /// Participants and the tracks each of them publishes.
    #[must_use]
    pub fn roster(&self) -> Vec<ParticipantInfo> {
        let state = self.state.lock();
        let mut roster: Vec<ParticipantInfo> = state
            .participants
            .keys()
            .map(|peer_id| {
                let mut tracks: Vec<String> = state
                    .tracks
                    .values()
                    .filter(|t| &t.publisher == peer_id)
                    .map(|t| t.id.to_string())
                    .collect();
                tracks.sort();
                ParticipantInfo {
                    user_id: peer_id.clone(),
                    tracks,
                }
            })
            .collect();
        roster.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        roster
    }

    /// Send the current roster to every lobby socket.
    pub async fn broadcast_access(&self) {
        let message = SignalMessage::Access(self.roster());
        let lobby: Vec<Arc<dyn SignalTransport>> =
            self.state.lock().lobby.values().cloned().collect();
        for transport in lobby {
            if let Err(e) = transport.send(&message).await {
                debug!(room_id = %self.id, error = %e, "Access update not delivered");
            }
        }
    }

    fn wire_events(self: &Arc<Self>, session: &Arc<ParticipantSession>) {
        let peer = session.peer();

        let weak_session = Arc::downgrade(session);
        peer.on_ice_candidate(Box::new(move |candidate| {
            let weak_session = weak_session.clone();
            Box::pin(async move {
                let Some(session) = weak_session.upgrade() else {
                    return;
                };
                if let Err(e) = session.send(&SignalMessage::Candidate(candidate)).await {
                    debug!(peer_id = %session.peer_id, error = %e, "Candidate not delivered");
                }
            })
        }));

        let weak_room = Arc::downgrade(self);
        let weak_session = Arc::downgrade(session);
        peer.on_connection_state_change(Box::new(move |state| {
            let weak_room = weak_room.clone();
            let weak_session = weak_session.clone();
            Box::pin(async move {
                let (Some(room), Some(session)) = (weak_room.upgrade(), weak_session.upgrade()) else {
                    return;
                };
                // handled off the peer connection's callback task
                tokio::spawn(async move {
                    room.handle_connection_state(&session, state).await;
                });
            })
        }));

        let weak_room = Arc::downgrade(self);
        let publisher = session.peer_id.clone();
        peer.on_track(Box::new(move |remote| {
            let relay = IngestRelay::new(weak_room.clone(), publisher.clone(), remote);
            Box::pin(async move {
                tokio::spawn(relay.run());
            })
        }));
    }

    pub(crate) async fn handle_connection_state(
        self: &Arc<Self>,
        session: &Arc<ParticipantSession>,
        state: ConnectionState,
    ) {
        info!(
            room_id = %self.id,
            peer_id = %session.peer_id,
            state = %state,
            "Peer connection state changed"
        );
        match state {
            ConnectionState::Connected => self.broadcast_access().await,
            ConnectionState::Disconnected => self.watch_disconnect(session),
            ConnectionState::Failed | ConnectionState::Closed => self.drop_session(session).await,
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    /// Close a disconnected peer that has not recovered within the grace
    /// period.
    fn watch_disconnect(self: &Arc<Self>, session: &Arc<ParticipantSession>) {
        let weak_room = Arc::downgrade(self);
        let weak_session = Arc::downgrade(session);
        let grace = self.config.disconnect_grace();
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(grace) => {}
            }
            let (Some(room), Some(session)) = (weak_room.upgrade(), weak_session.upgrade()) else {
                return;
            };
            if session.connection_state() == ConnectionState::Disconnected {
                warn!(
                    room_id = %room.id,
                    peer_id = %session.peer_id,
                    grace_secs = grace.as_secs(),
                    "Peer did not recover from disconnect"
                );
                room.drop_session(&session).await;
            }
        });
    }

    /// Hand the room back to the directory if nothing is left in it.
    pub(crate) fn request_reclaim(&self) {
        if let Some(directory) = self.directory.upgrade() {
            directory.reclaim(&self.id);
        }
    }

    /// Stop background tasks. Called once the room left the directory.
    pub(crate) fn shut_down(&self) {
        self.shutdown.cancel();
    }

    #[must_use]
    pub fn snapshot(&self) -> RoomSnapshot {
        let state = self.state.lock();
        let mut participants: Vec<ParticipantSnapshot> = state
            .participants
            .values()
            .map(|session| ParticipantSnapshot {
                peer_id: session.peer_id.clone(),
                session_id: session.id.clone(),
                connection_state: session.connection_state(),
                negotiation: session.negotiation_state(),
                offers_sent: session.offers_sent(),
            })
            .collect();
        participants.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        let mut tracks: Vec<TrackSnapshot> = state
            .tracks
            .values()
            .map(|track| TrackSnapshot {
                id: track.id.clone(),
                kind: track.kind,
                publisher: track.publisher.clone(),
                stats: track.stats(),
            })
            .collect();
        tracks.sort_by(|a, b| a.id.cmp(&b.id));

        RoomSnapshot {
            room_id: self.id.clone(),
            created_at: self.created_at,
            participants,
            tracks,
            lobby_connections: state.lobby.len(),
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.shutdown.cancel();
        debug!(room_id = %self.id, "Room dropped");
    }
}

/// Point-in-time view of a room
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub created_at: DateTime<Utc>,
    pub participants: Vec<ParticipantSnapshot>,
    pub tracks: Vec<TrackSnapshot>,
    pub lobby_connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub peer_id: PeerId,
    pub session_id: SessionId,
    pub connection_state: ConnectionState,
    pub negotiation: NegotiationState,
    pub offers_sent: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub id: TrackId,
    pub kind: TrackKind,
    pub publisher: PeerId,
    pub stats: TrackStats,
}
