//! Peer connection capability
//!
//! The coordinator never talks to a WebRTC stack directly. Everything it needs
//! from a peer connection goes through [`PeerConnection`], which keeps the
//! negotiation logic testable without ICE or DTLS. The production
//! implementation lives in [`crate::rtc`].

use crate::error::{Result, SfuError};
use crate::track::RemoteTrack;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// SDP message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
            Self::Rollback => "rollback",
        }
    }
}

/// SDP session description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Trickled ICE candidate, in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.candidate.trim().is_empty() {
            return Err(SfuError::InvalidMessage(
                "candidate string is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Aggregate connection state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States a peer connection never leaves.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A track the remote side is sending to us
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundTrack {
    pub track_id: String,
    pub ssrc: u32,
}

pub type TrackHandler = Box<dyn Fn(Arc<dyn RemoteTrack>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type IceCandidateHandler = Box<dyn Fn(IceCandidate) -> BoxFuture<'static, ()> + Send + Sync>;
pub type StateChangeHandler = Box<dyn Fn(ConnectionState) -> BoxFuture<'static, ()> + Send + Sync>;

/// Operations the coordinator performs on one participant's peer connection
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Attach a forwarded track as a new outbound sender.
    async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<()>;

    /// Detach the outbound sender currently carrying `track_id`.
    async fn remove_track(&self, track_id: &str) -> Result<()>;

    /// Ids of the tracks currently attached to outbound senders.
    async fn senders(&self) -> Vec<String>;

    /// Tracks the remote side is publishing, with a known SSRC.
    async fn receivers(&self) -> Vec<InboundTrack>;

    fn connection_state(&self) -> ConnectionState;

    /// Send a picture loss indication for the given inbound SSRC.
    async fn request_keyframe(&self, media_ssrc: u32) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn on_track(&self, handler: TrackHandler);

    fn on_ice_candidate(&self, handler: IceCandidateHandler);

    fn on_connection_state_change(&self, handler: StateChangeHandler);
}

/// Creates peer connections for newly joining participants
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create_peer(&self) -> Result<Arc<dyn PeerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_wire_shape() {
        let json = r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let candidate: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert!(candidate.username_fragment.is_none());
        assert!(candidate.validate().is_ok());
    }

    #[test]
    fn test_empty_candidate_is_rejected() {
        assert!(IceCandidate::new("  ").validate().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
        assert!(!ConnectionState::New.is_terminal());
    }

    #[test]
    fn test_description_serialization() {
        let json = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0");
    }
}
