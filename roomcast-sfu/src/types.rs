//! Identifier types shared by the coordinator

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identity of a participant, supplied by the upstream authentication layer
    PeerId
);

string_id!(
    /// Room key chosen by clients
    RoomId
);

string_id!(
    /// Registry key of a forwarded track
    TrackId
);

string_id!(
    /// Server-generated identity of one participant session
    SessionId
);

string_id!(
    /// Server-generated identity of one signaling socket
    ConnectionId
);

impl PeerId {
    /// Identity used by the read-only viewer socket of a user.
    #[must_use]
    pub fn viewer(user: &str) -> Self {
        Self(format!("{user}_viewer"))
    }
}

impl SessionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(12))
    }
}

impl ConnectionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(12))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewer_identity() {
        assert_eq!(PeerId::viewer("alice").as_str(), "alice_viewer");
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        assert_ne!(SessionId::generate(), SessionId::generate());
        assert_eq!(ConnectionId::generate().as_str().len(), 12);
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&RoomId::new("lobby")).unwrap();
        assert_eq!(json, "\"lobby\"");
    }
}
