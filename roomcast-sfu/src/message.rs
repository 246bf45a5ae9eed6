//! Signaling wire format
//!
//! Every frame is a JSON envelope `{"type": <event>, "data": <payload>}`.
//! Payloads may also arrive as a JSON document encoded inside a string,
//! which older browser clients still send.

use crate::error::{Result, SfuError};
use crate::peer::{IceCandidate, SdpType, SessionDescription};
use crate::types::{PeerId, RoomId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw signaling frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// SDP carried by `offer` and `answer` events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub sdp_type: Option<SdpType>,
    pub sdp: String,
}

impl SdpPayload {
    /// Convert into a description of the expected type, rejecting empty or
    /// mistyped SDP.
    pub fn into_description(self, expected: SdpType) -> Result<SessionDescription> {
        if self.sdp.trim().is_empty() {
            return Err(SfuError::InvalidMessage(format!(
                "{} without sdp",
                expected.as_str()
            )));
        }
        if let Some(actual) = self.sdp_type {
            if actual != expected {
                return Err(SfuError::InvalidMessage(format!(
                    "expected {} but got {}",
                    expected.as_str(),
                    actual.as_str()
                )));
            }
        }
        Ok(SessionDescription {
            sdp_type: expected,
            sdp: self.sdp,
        })
    }
}

impl From<SessionDescription> for SdpPayload {
    fn from(desc: SessionDescription) -> Self {
        Self {
            sdp_type: Some(desc.sdp_type),
            sdp: desc.sdp,
        }
    }
}

/// `join` request from a client, and the acknowledgment we send back
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<PeerId>,
}

/// One row of the `access` broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub user_id: PeerId,
    pub tracks: Vec<String>,
}

/// Decoded signaling event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalMessage {
    Offer(SdpPayload),
    Answer(SdpPayload),
    Candidate(IceCandidate),
    Join(JoinPayload),
    Access(Vec<ParticipantInfo>),
    Close,
}

impl SignalMessage {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Candidate(_) => "candidate",
            Self::Join(_) => "join",
            Self::Access(_) => "access",
            Self::Close => "close",
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self> {
        let Envelope { kind, data } = envelope;
        match kind.as_str() {
            "offer" => Ok(Self::Offer(payload(data)?)),
            "answer" => Ok(Self::Answer(payload(data)?)),
            "candidate" => Ok(Self::Candidate(payload(data)?)),
            "join" => Ok(Self::Join(payload(data)?)),
            "access" => Ok(Self::Access(payload(data)?)),
            "close" => Ok(Self::Close),
            other => Err(SfuError::InvalidMessage(format!("unknown event {other:?}"))),
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope> {
        let data = match self {
            Self::Offer(p) | Self::Answer(p) => serde_json::to_value(p)?,
            Self::Candidate(c) => serde_json::to_value(c)?,
            Self::Join(p) => serde_json::to_value(p)?,
            Self::Access(list) => serde_json::to_value(list)?,
            Self::Close => Value::Null,
        };
        Ok(Envelope {
            kind: self.kind().to_string(),
            data,
        })
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_envelope()?)?)
    }
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T> {
    let value = match data {
        Value::String(inner) => serde_json::from_str(&inner)?,
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    };
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_offer_object() {
        let msg = SignalMessage::decode(r#"{"type":"offer","data":{"type":"offer","sdp":"v=0"}}"#)
            .unwrap();
        let SignalMessage::Offer(payload) = msg else {
            panic!("expected offer");
        };
        let desc = payload.into_description(SdpType::Offer).unwrap();
        assert_eq!(desc.sdp, "v=0");
    }

    #[test]
    fn test_decode_string_encoded_answer() {
        let text = r#"{"type":"answer","data":"{\"type\":\"answer\",\"sdp\":\"v=0\"}"}"#;
        let msg = SignalMessage::decode(text).unwrap();
        assert!(matches!(msg, SignalMessage::Answer(_)));
    }

    #[test]
    fn test_decode_join_without_data() {
        let msg = SignalMessage::decode(r#"{"type":"join"}"#).unwrap();
        assert_eq!(msg, SignalMessage::Join(JoinPayload::default()));
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let err = SignalMessage::decode(r#"{"type":"dance","data":{}}"#).unwrap_err();
        assert!(matches!(err, SfuError::InvalidMessage(_)));
    }

    #[test]
    fn test_malformed_frame_is_rejected() {
        assert!(SignalMessage::decode("not json").is_err());
        assert!(SignalMessage::decode(r#"{"type":"candidate","data":{"sdpMid":"0"}}"#).is_err());
    }

    #[test]
    fn test_answer_type_mismatch() {
        let payload = SdpPayload {
            sdp_type: Some(SdpType::Offer),
            sdp: "v=0".to_string(),
        };
        assert!(payload.into_description(SdpType::Answer).is_err());
    }

    #[test]
    fn test_empty_sdp_is_rejected() {
        let payload = SdpPayload {
            sdp_type: None,
            sdp: String::new(),
        };
        assert!(payload.into_description(SdpType::Answer).is_err());
    }

    #[test]
    fn test_encode_close_and_access() {
        let close: Value = serde_json::from_str(&SignalMessage::Close.encode().unwrap()).unwrap();
        assert_eq!(close["type"], "close");
        assert!(close["data"].is_null());

        let access = SignalMessage::Access(vec![ParticipantInfo {
            user_id: PeerId::new("alice"),
            tracks: vec!["video-alice".to_string()],
        }]);
        let value: Value = serde_json::from_str(&access.encode().unwrap()).unwrap();
        assert_eq!(value["data"][0]["userId"], "alice");
        assert_eq!(value["data"][0]["tracks"][0], "video-alice");
    }
}
