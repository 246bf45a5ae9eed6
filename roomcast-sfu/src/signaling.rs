//! Per-socket signaling dispatch
//!
//! One [`SignalingConnection`] drives one client socket: it watches the room
//! from the lobby, admits the client as a participant on `join`, and routes
//! every inbound event to the room's negotiation handlers. Malformed or
//! unknown frames are logged and dropped without closing the socket.

use crate::directory::RoomDirectory;
use crate::error::{Result, SfuError};
use crate::message::{JoinPayload, SdpPayload, SignalMessage};
use crate::peer::{IceCandidate, PeerFactory, SdpType};
use crate::room::Room;
use crate::session::ParticipantSession;
use crate::transport::SignalTransport;
use crate::types::{ConnectionId, PeerId, RoomId};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Whether the read loop keeps going after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Leave,
}

pub struct SignalingConnection {
    directory: Arc<RoomDirectory>,
    factory: Arc<dyn PeerFactory>,
    room_id: RoomId,
    peer_id: PeerId,
    connection_id: ConnectionId,
    transport: Arc<dyn SignalTransport>,
    room: Option<Arc<Room>>,
    session: Option<Arc<ParticipantSession>>,
}

impl SignalingConnection {
    pub fn new(
        directory: Arc<RoomDirectory>,
        factory: Arc<dyn PeerFactory>,
        room_id: RoomId,
        peer_id: PeerId,
        transport: Arc<dyn SignalTransport>,
    ) -> Self {
        Self {
            directory,
            factory,
            room_id,
            peer_id,
            connection_id: ConnectionId::generate(),
            transport,
            room: None,
            session: None,
        }
    }

    /// Serve the socket until it closes or the client leaves. With
    /// `auto_join` the client is admitted right away, as viewer sockets are.
    pub async fn run(mut self, auto_join: bool) {
        info!(
            room_id = %self.room_id,
            peer_id = %self.peer_id,
            connection_id = %self.connection_id,
            "Signaling connection opened"
        );

        match self.directory.attach(&self.room_id, self.connection_id.clone(), Arc::clone(&self.transport)) {
            Ok(room) => {
                room.broadcast_access().await;
                self.room = Some(room);
            }
            Err(e) => {
                warn!(room_id = %self.room_id, peer_id = %self.peer_id, error = %e, "Connection refused");
                self.transport.close().await;
                return;
            }
        }

        if auto_join {
            if let Err(e) = self.join().await {
                warn!(room_id = %self.room_id, peer_id = %self.peer_id, error = %e, "Join failed");
            }
        }

        while let Some(frame) = self.transport.read_message().await {
            let text = match frame {
                Ok(text) => text,
                Err(e) => {
                    debug!(peer_id = %self.peer_id, error = %e, "Socket read failed");
                    break;
                }
            };
            let message = match SignalMessage::decode(&text) {
                Ok(message) => message,
                Err(e) => {
                    warn!(peer_id = %self.peer_id, error = %e, "Dropping malformed signaling frame");
                    continue;
                }
            };

            let kind = message.kind();
            match self.dispatch(message).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Leave) => break,
                Err(e) => {
                    warn!(peer_id = %self.peer_id, event = kind, error = %e, "Signaling event failed");
                }
            }
        }

        self.teardown().await;
    }

    async fn dispatch(&mut self, message: SignalMessage) -> Result<Flow> {
        match message {
            SignalMessage::Join(payload) => self.handle_join(payload).await,
            SignalMessage::Offer(payload) => self.handle_offer(payload).await,
            SignalMessage::Answer(payload) => self.handle_answer(payload).await,
            SignalMessage::Candidate(candidate) => self.handle_candidate(candidate).await,
            SignalMessage::Close => Ok(Flow::Leave),
            SignalMessage::Access(_) => Err(SfuError::InvalidMessage(
                "access is a server event".to_string(),
            )),
        }
    }

    async fn handle_join(&mut self, payload: JoinPayload) -> Result<Flow> {
        if let Some(requested) = payload.room_id.as_ref().filter(|id| **id != self.room_id) {
            debug!(
                requested = %requested,
                room_id = %self.room_id,
                "Join names another room, using the socket's room"
            );
        }
        self.join().await?;
        Ok(Flow::Continue)
    }

    /// Admit this socket's client, acknowledge, and negotiate.
    async fn join(&mut self) -> Result<()> {
        let session = self.admit().await?;
        let room = self.current_room()?;

        session
            .send(&SignalMessage::Join(JoinPayload {
                room_id: Some(self.room_id.clone()),
                user_id: Some(self.peer_id.clone()),
            }))
            .await?;
        room.broadcast_access().await;
        room.sync().await;
        Ok(())
    }

    /// Create a peer connection and register a fresh session, replacing
    /// any session this socket held before.
    async fn admit(&mut self) -> Result<Arc<ParticipantSession>> {
        if let Some(previous) = self.session.take() {
            if let Some(room) = &self.room {
                room.detach(&previous);
            }
            // the socket carries on with the new session
            previous.close_peer().await;
            debug!(
                peer_id = %self.peer_id,
                session_id = %previous.id,
                "Replacing this socket's session"
            );
        }

        let peer = self.factory.create_peer().await?;
        let session = ParticipantSession::new(self.peer_id.clone(), peer, Arc::clone(&self.transport));
        let room = self.directory.join(&self.room_id, Arc::clone(&session)).await?;
        self.room = Some(room);
        self.session = Some(Arc::clone(&session));
        Ok(session)
    }

    fn current_room(&self) -> Result<Arc<Room>> {
        self.room
            .clone()
            .ok_or_else(|| SfuError::NotFound(format!("room {}", self.room_id)))
    }

    fn current_session(&self) -> Result<Arc<ParticipantSession>> {
        self.session
            .clone()
            .filter(|session| !session.is_closed())
            .ok_or_else(|| SfuError::NotFound(format!("session for {}", self.peer_id)))
    }

    /// Client-initiated offer: answer it on the client's session, creating
    /// the session first if the client never sent `join`.
    async fn handle_offer(&mut self, payload: SdpPayload) -> Result<Flow> {
        let offer = payload.into_description(SdpType::Offer)?;
        let session = match self.current_session() {
            Ok(session) => session,
            Err(_) => self.admit().await?,
        };
        let room = self.current_room()?;
        room.accept_offer(&session, offer).await?;
        room.broadcast_access().await;
        Ok(Flow::Continue)
    }

    async fn handle_answer(&mut self, payload: SdpPayload) -> Result<Flow> {
        let answer = payload.into_description(SdpType::Answer)?;
        let session = self.current_session()?;
        let room = self.current_room()?;
        room.apply_answer(&session, answer).await?;
        Ok(Flow::Continue)
    }

    async fn handle_candidate(&mut self, candidate: IceCandidate) -> Result<Flow> {
        candidate.validate()?;
        let session = self.current_session()?;
        session.peer().add_ice_candidate(candidate).await?;
        Ok(Flow::Continue)
    }

    async fn teardown(mut self) {
        if let (Some(room), Some(session)) = (self.room.as_ref(), self.session.take()) {
            room.drop_session(&session).await;
        }
        self.transport.close().await;
        self.directory.detach(&self.room_id, &self.connection_id);
        if let Some(room) = self.room.take() {
            room.broadcast_access().await;
        }
        info!(
            room_id = %self.room_id,
            peer_id = %self.peer_id,
            connection_id = %self.connection_id,
            "Signaling connection closed"
        );
    }
}
