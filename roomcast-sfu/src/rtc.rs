//! webrtc-rs backed peer connections

use crate::error::{Result, SfuError};
use crate::peer::{
    ConnectionState, IceCandidate, IceCandidateHandler, InboundTrack, PeerConnection, PeerFactory,
    SdpType, SessionDescription, StateChangeHandler, TrackHandler,
};
use crate::track::{RemoteTrack, TrackKind};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// ICE and transport settings for server-side peer connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcSettings {
    pub stun_servers: Vec<String>,
    /// Lower bound of the UDP port range (0 = any port)
    pub udp_port_min: u16,
    pub udp_port_max: u16,
    /// Public addresses advertised in host candidates
    pub nat_1to1_ips: Vec<String>,
}

impl Default for RtcSettings {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            udp_port_min: 0,
            udp_port_max: 0,
            nat_1to1_ips: Vec::new(),
        }
    }
}

/// Builds one webrtc-rs peer connection per participant, receiving one
/// audio and one video track from it.
pub struct RtcPeerFactory {
    settings: RtcSettings,
}

impl RtcPeerFactory {
    pub fn new(settings: RtcSettings) -> Result<Self> {
        if settings.udp_port_min > settings.udp_port_max {
            return Err(SfuError::Transport(format!(
                "invalid UDP port range {}-{}",
                settings.udp_port_min, settings.udp_port_max
            )));
        }
        info!(
            stun_servers = ?settings.stun_servers,
            udp_port_min = settings.udp_port_min,
            udp_port_max = settings.udp_port_max,
            "WebRTC peer factory configured"
        );
        Ok(Self { settings })
    }

    fn setting_engine(&self) -> Result<SettingEngine> {
        let mut setting_engine = SettingEngine::default();
        if self.settings.udp_port_min > 0 && self.settings.udp_port_max > 0 {
            let ephemeral = EphemeralUDP::new(self.settings.udp_port_min, self.settings.udp_port_max)
                .map_err(|e| SfuError::Transport(format!("invalid UDP port range: {e}")))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }
        if !self.settings.nat_1to1_ips.is_empty() {
            setting_engine.set_nat_1to1_ips(self.settings.nat_1to1_ips.clone(), RTCIceCandidateType::Host);
        }
        Ok(setting_engine)
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create_peer(&self) -> Result<Arc<dyn PeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(self.setting_engine()?)
            .build();

        let ice_servers = if self.settings.stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.settings.stun_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        }

        Ok(Arc::new(RtcPeer { pc }))
    }
}

/// [`PeerConnection`] over a webrtc-rs `RTCPeerConnection`
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeer {
    #[must_use]
    pub fn new(pc: Arc<RTCPeerConnection>) -> Self {
        Self { pc }
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let description = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpType::Rollback => {
            return Err(SfuError::Negotiation("rollback is not supported".to_string()))
        }
    };
    Ok(description)
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => Self::New,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<()> {
        let sender = self
            .pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Drain RTCP so the interceptors see receiver reports and NACKs.
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        for sender in self.pc.get_senders().await {
            let Some(track) = sender.track().await else {
                continue;
            };
            if track.id() == track_id {
                self.pc.remove_track(&sender).await?;
            }
        }
        Ok(())
    }

    async fn senders(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for sender in self.pc.get_senders().await {
            if let Some(track) = sender.track().await {
                ids.push(track.id().to_string());
            }
        }
        ids
    }

    async fn receivers(&self) -> Vec<InboundTrack> {
        let mut inbound = Vec::new();
        for receiver in self.pc.get_receivers().await {
            let Some(track) = receiver.tracks().await.into_iter().next() else {
                continue;
            };
            let track_id = track.id();
            let ssrc = track.ssrc();
            if ssrc != 0 && !track_id.is_empty() {
                inbound.push(InboundTrack { track_id, ssrc });
            }
        }
        inbound
    }

    fn connection_state(&self) -> ConnectionState {
        self.pc.connection_state().into()
    }

    async fn request_keyframe(&self, media_ssrc: u32) -> Result<()> {
        self.pc
            .write_rtcp(&[Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            })])
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }

    fn on_track(&self, handler: TrackHandler) {
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            debug!(track_id = %track.id(), ssrc = track.ssrc(), "Remote track arrived");
            let remote: Arc<dyn RemoteTrack> = Arc::new(RtcRemoteTrack::new(track));
            handler(remote)
        }));
    }

    fn on_ice_candidate(&self, handler: IceCandidateHandler) {
        self.pc.on_ice_candidate(Box::new(
            move |candidate: Option<RTCIceCandidate>| -> BoxFuture<'static, ()> {
                match candidate.map(|c| c.to_json()) {
                    Some(Ok(init)) => handler(IceCandidate::from(init)),
                    Some(Err(e)) => {
                        debug!(error = %e, "Failed to serialize local candidate");
                        Box::pin(async {})
                    }
                    // end of gathering
                    None => Box::pin(async {}),
                }
            },
        ));
    }

    fn on_connection_state_change(&self, handler: StateChangeHandler) {
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                handler(ConnectionState::from(state))
            }));
    }
}

/// [`RemoteTrack`] over a webrtc-rs `TrackRemote`
pub struct RtcRemoteTrack {
    track: Arc<TrackRemote>,
}

impl RtcRemoteTrack {
    #[must_use]
    pub fn new(track: Arc<TrackRemote>) -> Self {
        Self { track }
    }
}

#[async_trait]
impl RemoteTrack for RtcRemoteTrack {
    fn id(&self) -> String {
        self.track.id()
    }

    fn stream_id(&self) -> String {
        self.track.stream_id()
    }

    fn kind(&self) -> TrackKind {
        TrackKind::from(self.track.kind())
    }

    fn ssrc(&self) -> u32 {
        self.track.ssrc()
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        self.track.codec().capability
    }

    async fn read(&self, buf: &mut [u8]) -> Result<Packet> {
        let (packet, _attributes) = self.track.read(buf).await?;
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(ConnectionState::from(RTCPeerConnectionState::Failed), ConnectionState::Failed);
        assert_eq!(ConnectionState::from(RTCPeerConnectionState::Unspecified), ConnectionState::New);
    }

    #[test]
    fn test_rollback_is_rejected() {
        let desc = SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        };
        assert!(to_rtc_description(desc).is_err());
    }

    #[test]
    fn test_invalid_port_range() {
        let settings = RtcSettings {
            udp_port_min: 50000,
            udp_port_max: 40000,
            ..RtcSettings::default()
        };
        assert!(RtcPeerFactory::new(settings).is_err());
    }

    #[tokio::test]
    async fn test_factory_creates_receiving_peer() {
        let factory = RtcPeerFactory::new(RtcSettings {
            stun_servers: Vec::new(),
            ..RtcSettings::default()
        })
        .unwrap();
        let peer = factory.create_peer().await.unwrap();
        assert_eq!(peer.connection_state(), ConnectionState::New);
        assert!(peer.senders().await.is_empty());

        let offer = peer.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("recvonly"));
        peer.close().await.unwrap();
    }
}
