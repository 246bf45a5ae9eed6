use thiserror::Error;

/// Coordinator error types
#[derive(Debug, Error)]
pub enum SfuError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Peer connection closed")]
    ConnectionClosed,

    #[error("Invalid signaling message: {0}")]
    InvalidMessage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Limit reached: {0}")]
    RoomLimit(String),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SfuError>;

impl SfuError {
    /// Failures a later sync pass may recover from.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Negotiation(_) | Self::Transport(_) | Self::WebRtc(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SfuError::Negotiation("offer".into()).is_transient());
        assert!(SfuError::Transport("write".into()).is_transient());
        assert!(!SfuError::ConnectionClosed.is_transient());
        assert!(!SfuError::NotFound("room".into()).is_transient());
        assert!(!SfuError::RoomLimit("rooms".into()).is_transient());
    }

    #[test]
    fn test_display() {
        let err = SfuError::NotFound("participant bob".into());
        assert_eq!(err.to_string(), "Not found: participant bob");
    }
}
