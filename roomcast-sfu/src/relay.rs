//! Ingest relays
//!
//! Each published remote track gets one relay task that copies its RTP into
//! the room's forward track and withdraws the track once reading fails.

use crate::room::Room;
use crate::track::{strip_header_extensions, ForwardTrack, RemoteTrack, RTP_READ_BUFFER};
use crate::types::PeerId;
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::util::marshal::MarshalSize;

/// Copies RTP from one published remote track into its forward track for as
/// long as the remote track can be read.
pub struct IngestRelay {
    room: Weak<Room>,
    publisher: PeerId,
    remote: Arc<dyn RemoteTrack>,
}

impl IngestRelay {
    pub fn new(room: Weak<Room>, publisher: PeerId, remote: Arc<dyn RemoteTrack>) -> Self {
        Self {
            room,
            publisher,
            remote,
        }
    }

    pub async fn run(self) {
        let Some(room) = self.room.upgrade() else {
            return;
        };
        let track = Arc::new(ForwardTrack::for_remote(&self.publisher, self.remote.as_ref()));
        let room_id = room.id.clone();
        room.add_track(Arc::clone(&track)).await;
        // the relay must not keep the room alive
        drop(room);

        let mut buf = vec![0u8; RTP_READ_BUFFER];
        let reason = loop {
            let mut packet = match self.remote.read(&mut buf).await {
                Ok(packet) => packet,
                Err(e) => break e,
            };
            strip_header_extensions(&mut packet);
            let size = packet.header.marshal_size() + packet.payload.len();
            if let Err(e) = track.local.write_rtp(&packet).await {
                debug!(track_id = %track.id, error = %e, "Forward write failed");
                continue;
            }
            track.record_forwarded(size);
        };

        let stats = track.stats();
        info!(
            room_id = %room_id,
            track_id = %track.id,
            publisher = %self.publisher,
            packets = stats.packets_forwarded,
            reason = %reason,
            "Ingest relay stopped"
        );

        if let Some(room) = self.room.upgrade() {
            room.remove_track(&track).await;
            room.request_reclaim();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RoomDirectory;
    use crate::testing::FakeRemoteTrack;
    use crate::track::TrackKind;
    use crate::types::{RoomId, TrackId};
    use crate::SfuConfig;
    use bytes::Bytes;
    use std::time::Duration;
    use webrtc::rtp::header::{Extension, Header};
    use webrtc::rtp::packet::Packet;

    async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    fn packet_with_extension(sequence_number: u16) -> Packet {
        Packet {
            header: Header {
                version: 2,
                sequence_number,
                extension: true,
                extension_profile: 0xBEDE,
                extensions: vec![Extension {
                    id: 1,
                    payload: Bytes::from_static(&[0x10, 0x20, 0x30]),
                }],
                ..Header::default()
            },
            payload: Bytes::from_static(&[0xAA, 0xBB, 0xCC]),
        }
    }

    #[tokio::test]
    async fn test_relay_registers_then_withdraws_track() {
        let directory = RoomDirectory::new(SfuConfig::default());
        let room = directory.get_or_create(&RoomId::new("r1"));
        let (remote, packets) = FakeRemoteTrack::new("cam", TrackKind::Video);

        let relay = IngestRelay::new(Arc::downgrade(&room), PeerId::new("alice"), remote);
        let handle = tokio::spawn(relay.run());

        packets.send(Packet::default()).await.unwrap();
        packets.send(Packet::default()).await.unwrap();
        tokio::task::yield_now().await;

        // closing the sender ends the remote track
        drop(packets);
        handle.await.unwrap();

        assert_eq!(room.track_count(), 0);
        assert!(directory.get(&RoomId::new("r1")).is_none());
    }

    #[tokio::test]
    async fn test_relay_forwards_packets_without_extensions() {
        let directory = RoomDirectory::new(SfuConfig::default());
        let room = directory.get_or_create(&RoomId::new("r1"));
        let (remote, packets) = FakeRemoteTrack::new("cam", TrackKind::Video);

        let relay = IngestRelay::new(Arc::downgrade(&room), PeerId::new("alice"), remote);
        let handle = tokio::spawn(relay.run());

        packets.send(packet_with_extension(1)).await.unwrap();
        packets.send(packet_with_extension(2)).await.unwrap();

        let track_id = TrackId::new("video-alice");
        wait_for("both packets forwarded", || {
            room.track(&track_id)
                .is_some_and(|track| track.stats().packets_forwarded == 2)
        })
        .await;

        // a bare 12 byte header plus payload: the extension block is gone
        let stats = room.track(&track_id).unwrap().stats();
        assert_eq!(stats.bytes_forwarded, 2 * (12 + 3));

        drop(packets);
        handle.await.unwrap();
        assert!(room.track(&track_id).is_none());
    }
}
