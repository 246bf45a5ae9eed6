//! Roomcast SFU room coordinator
//!
//! This crate keeps many-to-many WebRTC rooms consistent: every participant
//! receives every track the others publish, and server-initiated
//! renegotiation never collides with an offer that is still outstanding.
//!
//! ## Architecture
//!
//! - **`RoomDirectory`**: process-wide map of live rooms, admission and reclamation
//! - **`Room`**: participants, track registry and lobby sockets of one room
//! - **`ParticipantSession`**: one participant's transport, peer connection and negotiation flags
//! - **Renegotiation engine** (`Room::sync`): reconciles senders with the registry
//! - **`IngestRelay`**: copies RTP from a published track into its forward track
//! - **`RetryScheduler`**: deferred sync retries for rooms that did not converge
//! - **`SignalingConnection`**: per-socket event dispatch
//!
//! Peer connections and sockets are reached only through the
//! [`PeerConnection`] and [`SignalTransport`] traits; [`rtc`] provides the
//! webrtc-rs implementation.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use roomcast_sfu::{RoomDirectory, SfuConfig, SignalingConnection};
//!
//! let directory = RoomDirectory::new(SfuConfig::default());
//! let connection = SignalingConnection::new(directory, factory, room_id, peer_id, transport);
//! connection.run(false).await;
//! ```

mod config;
mod directory;
mod error;
mod message;
mod negotiation;
mod peer;
mod relay;
mod retry;
mod room;
mod session;
mod signaling;
mod track;
mod transport;
mod types;

pub mod rtc;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::SfuConfig;
pub use directory::{DirectoryStats, RoomDirectory};
pub use error::{Result, SfuError};
pub use message::{Envelope, JoinPayload, ParticipantInfo, SdpPayload, SignalMessage};
pub use negotiation::{SyncOutcome, SyncPlan};
pub use peer::{
    ConnectionState, IceCandidate, IceCandidateHandler, InboundTrack, PeerConnection, PeerFactory,
    SdpType, SessionDescription, StateChangeHandler, TrackHandler,
};
pub use relay::IngestRelay;
pub use retry::{RetryHandle, RetryScheduler};
pub use room::{ParticipantSnapshot, Room, RoomSnapshot, TrackSnapshot};
pub use session::{NegotiationState, ParticipantSession};
pub use signaling::SignalingConnection;
pub use track::{ForwardTrack, RemoteTrack, TrackKind, TrackStats};
pub use transport::SignalTransport;
pub use types::{ConnectionId, PeerId, RoomId, SessionId, TrackId};
