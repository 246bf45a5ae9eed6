//! Forwarded media tracks
//!
//! A published remote track is mirrored into one [`ForwardTrack`], a local
//! RTP track that every other participant of the room receives through its
//! own outbound sender.

use crate::error::Result;
use crate::types::{PeerId, TrackId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// Read buffer size for inbound RTP, one MTU
pub const RTP_READ_BUFFER: usize = 1500;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Inbound media published by a participant
#[async_trait]
pub trait RemoteTrack: Send + Sync {
    fn id(&self) -> String;

    fn stream_id(&self) -> String;

    fn kind(&self) -> TrackKind;

    fn ssrc(&self) -> u32;

    fn codec(&self) -> RTCRtpCodecCapability;

    /// Read the next RTP packet using `buf` as scratch space.
    async fn read(&self, buf: &mut [u8]) -> Result<Packet>;
}

/// Registry entry: one published track and the local track it feeds
pub struct ForwardTrack {
    pub id: TrackId,
    pub kind: TrackKind,
    pub publisher: PeerId,
    /// Id of the remote track on the publisher's connection
    pub source_id: String,
    pub local: Arc<TrackLocalStaticRTP>,
    packets_forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
}

impl ForwardTrack {
    /// Mirror a remote track. The id is `<kind>-<publisher>`, so each
    /// participant publishes at most one audio and one video track. The
    /// local track takes the publisher's codec, and its stream id is the
    /// publisher so subscribers can group media by participant.
    #[must_use]
    pub fn for_remote(publisher: &PeerId, remote: &dyn RemoteTrack) -> Self {
        let source_id = remote.id();
        let kind = remote.kind();
        let id = TrackId::new(format!("{kind}-{publisher}"));
        let codec = remote.codec();

        info!(
            track_id = %id,
            publisher = %publisher,
            kind = %kind,
            codec = %codec.mime_type,
            "Creating forward track"
        );

        let local = Arc::new(TrackLocalStaticRTP::new(
            codec,
            id.to_string(),
            publisher.to_string(),
        ));

        Self {
            id,
            kind,
            publisher: publisher.clone(),
            source_id,
            local,
            packets_forwarded: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
        }
    }

    /// Whether `participant` must not receive this track: it published it,
    /// or it is sending this very track back to us.
    #[must_use]
    pub fn is_loopback_for(&self, participant: &PeerId, inbound_ids: &[String]) -> bool {
        &self.publisher == participant || inbound_ids.iter().any(|id| id == self.id.as_str())
    }

    pub(crate) fn record_forwarded(&self, bytes: usize) {
        self.packets_forwarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stats(&self) -> TrackStats {
        TrackStats {
            packets_forwarded: self.packets_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for ForwardTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("publisher", &self.publisher)
            .field("source_id", &self.source_id)
            .finish_non_exhaustive()
    }
}

/// Forwarding counters of one track
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackStats {
    pub packets_forwarded: u64,
    pub bytes_forwarded: u64,
}

/// Drop header extensions; their ids are negotiated per connection and
/// would be meaningless to subscribers.
pub fn strip_header_extensions(packet: &mut Packet) {
    packet.header.extension = false;
    packet.header.extension_profile = 0;
    packet.header.extensions.clear();
}
