//! Room directory - process-wide map of live rooms
//!
//! This module provides:
//! - Lazy room creation keyed by room id
//! - Atomic admission of participants, with same-identity replacement
//! - Resource limit enforcement on admission
//! - Reclamation of rooms that have nothing left in them

use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::retry::{RetryHandle, RetryScheduler};
use crate::room::{Room, RoomSnapshot};
use crate::session::ParticipantSession;
use crate::transport::SignalTransport;
use crate::types::{ConnectionId, PeerId, RoomId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Directory-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryStats {
    pub rooms: usize,
    pub participants: usize,
    pub tracks: usize,
    pub lobby_connections: usize,
    pub deferred_retries: u64,
}

pub struct RoomDirectory {
    config: Arc<SfuConfig>,
    rooms: DashMap<RoomId, Arc<Room>>,
    retry: RetryHandle,
    self_ref: Weak<RoomDirectory>,
}

impl RoomDirectory {
    /// Create the directory and its retry scheduler. Must be called inside
    /// a tokio runtime.
    pub fn new(config: SfuConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let directory = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            retry: RetryScheduler::spawn(weak.clone(), config.retry_delay()),
            config: Arc::clone(&config),
            rooms: DashMap::new(),
            self_ref: weak.clone(),
        });

        info!(
            keyframe_interval_ms = config.keyframe_interval_ms,
            max_sync_attempts = config.max_sync_attempts,
            max_rooms = config.max_rooms,
            max_participants_per_room = config.max_participants_per_room,
            "Room directory initialized"
        );
        directory
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    fn new_room(&self, room_id: &RoomId) -> Arc<Room> {
        Room::new(
            room_id.clone(),
            Arc::clone(&self.config),
            self.retry.clone(),
            self.self_ref.clone(),
        )
    }

    /// Existing room, or a fresh one. Never fails.
    pub fn get_or_create(&self, room_id: &RoomId) -> Arc<Room> {
        Arc::clone(
            self.rooms
                .entry(room_id.clone())
                .or_insert_with(|| self.new_room(room_id))
                .value(),
        )
    }

    #[must_use]
    pub fn get(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|room| Arc::clone(room.value()))
    }

    /// Run `f` on the room for `room_id` while holding its directory slot,
    /// creating the room within the room limit if needed.
    fn with_room<T>(
        &self,
        room_id: &RoomId,
        f: impl FnOnce(&Arc<Room>) -> Result<T>,
    ) -> Result<(Arc<Room>, T)> {
        // counted before taking the slot; len() locks every shard
        let limit = self.config.max_rooms;
        let at_limit = limit > 0 && self.rooms.len() >= limit;

        match self.rooms.entry(room_id.clone()) {
            Entry::Occupied(entry) => {
                let room = Arc::clone(entry.get());
                let value = f(&room)?;
                Ok((room, value))
            }
            Entry::Vacant(entry) => {
                if at_limit {
                    warn!(room_id = %room_id, max_rooms = limit, "Room limit reached");
                    return Err(SfuError::RoomLimit(format!(
                        "maximum number of rooms ({limit}) reached"
                    )));
                }
                let room = self.new_room(room_id);
                let value = f(&room)?;
                entry.insert(Arc::clone(&room));
                Ok((room, value))
            }
        }
    }

    /// Register a signaling socket as a watcher of the room.
    pub fn attach(
        &self,
        room_id: &RoomId,
        connection_id: ConnectionId,
        transport: Arc<dyn SignalTransport>,
    ) -> Result<Arc<Room>> {
        let (room, ()) = self.with_room(room_id, |room| {
            room.register_lobby(connection_id, transport);
            Ok(())
        })?;
        Ok(room)
    }

    /// Remove a watcher; the room is reclaimed if that left it empty.
    pub fn detach(&self, room_id: &RoomId, connection_id: &ConnectionId) {
        if let Some(room) = self.get(room_id) {
            room.unregister_lobby(connection_id);
        }
        self.reclaim(room_id);
    }

    /// Admit `session` to the room. A previous session with the same
    /// identity is replaced and evicted.
    pub async fn join(&self, room_id: &RoomId, session: Arc<ParticipantSession>) -> Result<Arc<Room>> {
        let peer_id = session.peer_id.clone();
        let (room, evicted) = self.with_room(room_id, |room| room.admit(session))?;

        if let Some(previous) = evicted {
            info!(
                room_id = %room_id,
                peer_id = %peer_id,
                session_id = %previous.id,
                "Replacing existing session"
            );
            previous.evict().await;
        }
        Ok(room)
    }

    /// Remove a participant on request of an external caller.
    pub async fn leave(&self, room_id: &RoomId, peer_id: &PeerId) -> Result<()> {
        let room = self
            .get(room_id)
            .ok_or_else(|| SfuError::NotFound(format!("room {room_id}")))?;
        room.remove_participant(peer_id)
            .await
            .map(|_| ())
            .ok_or_else(|| SfuError::NotFound(format!("participant {peer_id} in room {room_id}")))
    }

    /// Whether `peer_id` could join `room_id` right now without replacing
    /// an existing session.
    #[must_use]
    pub fn can_join(&self, room_id: &RoomId, peer_id: &PeerId) -> bool {
        !self
            .get(room_id)
            .is_some_and(|room| room.participant(peer_id).is_some())
    }

    /// Delete the room if it is empty. Returns whether it was deleted.
    pub fn reclaim(&self, room_id: &RoomId) -> bool {
        match self.rooms.remove_if(room_id, |_, room| room.is_empty()) {
            Some((_, room)) => {
                room.shut_down();
                info!(room_id = %room_id, remaining_rooms = self.rooms.len(), "Room reclaimed");
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.rooms.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<RoomSnapshot> {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|entry| Arc::clone(entry.value())).collect();
        let mut snapshots: Vec<RoomSnapshot> = rooms.iter().map(|room| room.snapshot()).collect();
        snapshots.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        snapshots
    }

    #[must_use]
    pub fn stats(&self) -> DirectoryStats {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|entry| Arc::clone(entry.value())).collect();
        let mut stats = DirectoryStats {
            rooms: rooms.len(),
            deferred_retries: self.retry.requested(),
            ..DirectoryStats::default()
        };
        for room in rooms {
            stats.participants += room.participant_count();
            stats.tracks += room.track_count();
            stats.lobby_connections += room.lobby_count();
        }
        stats
    }

    /// Close every session and stop every room.
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|entry| Arc::clone(entry.value())).collect();
        self.rooms.clear();
        for room in rooms {
            for session in room.participants() {
                room.detach(&session);
                session.evict().await;
            }
            room.shut_down();
            debug!(room_id = %room.id, "Room shut down");
        }
        info!("Room directory shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePeer, FakeTransport};

    fn session(peer_id: &str) -> Arc<ParticipantSession> {
        ParticipantSession::new(PeerId::new(peer_id), FakePeer::new(), FakeTransport::new())
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_room() {
        let directory = RoomDirectory::new(SfuConfig::default());
        let room_id = RoomId::from("test-room");

        let room = directory.get_or_create(&room_id);
        let again = directory.get_or_create(&room_id);
        assert!(Arc::ptr_eq(&room, &again));
        assert_eq!(directory.room_count(), 1);
    }

    #[tokio::test]
    async fn test_participant_limit() {
        let config = SfuConfig {
            max_participants_per_room: 2,
            ..SfuConfig::default()
        };
        let directory = RoomDirectory::new(config);
        let room_id = RoomId::from("test-room");

        directory.join(&room_id, session("peer1")).await.unwrap();
        directory.join(&room_id, session("peer2")).await.unwrap();

        let result = directory.join(&room_id, session("peer3")).await;
        assert!(matches!(result, Err(SfuError::RoomLimit(_))));

        // replacing an existing identity is not a new admission
        directory.join(&room_id, session("peer2")).await.unwrap();
    }

    #[tokio::test]
    async fn test_room_limit() {
        let config = SfuConfig {
            max_rooms: 1,
            ..SfuConfig::default()
        };
        let directory = RoomDirectory::new(config);

        directory.join(&RoomId::from("room1"), session("a")).await.unwrap();
        let result = directory.join(&RoomId::from("room2"), session("b")).await;
        assert!(matches!(result, Err(SfuError::RoomLimit(_))));
        assert_eq!(directory.room_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_identity_evicts_previous_session() {
        let directory = RoomDirectory::new(SfuConfig::default());
        let room_id = RoomId::from("test-room");

        let first_peer = FakePeer::new();
        let first_transport = FakeTransport::new();
        let first = ParticipantSession::new(PeerId::new("alice"), first_peer.clone(), first_transport.clone());
        directory.join(&room_id, first).await.unwrap();

        let second = session("alice");
        let room = directory.join(&room_id, Arc::clone(&second)).await.unwrap();

        assert_eq!(room.participant_count(), 1);
        assert_eq!(room.participant(&PeerId::new("alice")).unwrap().id, second.id);
        assert_eq!(first_peer.close_count(), 1);
        assert!(first_transport.is_closed());
        assert_eq!(first_transport.sent(), vec![crate::SignalMessage::Close]);
    }

    #[tokio::test]
    async fn test_leave_unknown_room_or_participant() {
        let directory = RoomDirectory::new(SfuConfig::default());
        let room_id = RoomId::from("test-room");

        assert!(matches!(
            directory.leave(&room_id, &PeerId::new("ghost")).await,
            Err(SfuError::NotFound(_))
        ));

        let watcher = FakeTransport::new();
        directory.attach(&room_id, ConnectionId::generate(), watcher).unwrap();
        assert!(matches!(
            directory.leave(&room_id, &PeerId::new("ghost")).await,
            Err(SfuError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reclaim_only_empty_rooms() {
        let directory = RoomDirectory::new(SfuConfig::default());
        let room_id = RoomId::from("test-room");
        let connection = ConnectionId::generate();

        directory.attach(&room_id, connection.clone(), FakeTransport::new()).unwrap();
        assert!(!directory.reclaim(&room_id));

        directory.detach(&room_id, &connection);
        assert!(directory.get(&room_id).is_none());
        // reclaiming an absent room is a no-op
        assert!(!directory.reclaim(&room_id));
    }

    #[tokio::test]
    async fn test_can_join() {
        let directory = RoomDirectory::new(SfuConfig::default());
        let room_id = RoomId::from("test-room");
        assert!(directory.can_join(&room_id, &PeerId::new("alice")));

        directory.join(&room_id, session("alice")).await.unwrap();
        assert!(!directory.can_join(&room_id, &PeerId::new("alice")));
        assert!(directory.can_join(&room_id, &PeerId::new("bob")));
    }

    #[tokio::test]
    async fn test_stats() {
        let directory = RoomDirectory::new(SfuConfig::default());
        directory.join(&RoomId::from("r1"), session("a")).await.unwrap();
        directory.join(&RoomId::from("r2"), session("b")).await.unwrap();
        directory.attach(&RoomId::from("r2"), ConnectionId::generate(), FakeTransport::new()).unwrap();

        let stats = directory.stats();
        assert_eq!(stats.rooms, 2);
        assert_eq!(stats.participants, 2);
        assert_eq!(stats.lobby_connections, 1);
        assert_eq!(directory.room_ids(), vec![RoomId::from("r1"), RoomId::from("r2")]);
    }
}
