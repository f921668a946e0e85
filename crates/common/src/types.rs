//! Identifier types for meetings, rooms and media handles.
//!
//! Server-generated identifiers wrap a [`Uuid`]. Identifiers that originate
//! outside the service (user ids from the identity provider, room ids chosen
//! at scheduling time) wrap a `String`. All of them serialize as plain JSON
//! strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the identifier as a string slice
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

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a meeting
    MeetingId
);

uuid_id!(
    /// Identifier of one signaling connection. Fresh per connection, never reused.
    PeerId
);

uuid_id!(
    /// Identifier of a media router (one per live room)
    RouterId
);

uuid_id!(
    /// Identifier of a negotiated media transport
    TransportId
);

uuid_id!(
    /// Identifier of an inbound media stream
    ProducerId
);

uuid_id!(
    /// Identifier of an outbound forwarding of a producer
    ConsumerId
);

string_id!(
    /// Identifier of a room, the addressable counterpart of a meeting
    RoomId
);

string_id!(
    /// Identifier of a user as issued by the identity provider
    UserId
);

impl RoomId {
    /// Generate a room identifier for a newly scheduled meeting
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

impl UserId {
    /// Generate an identifier for an unauthenticated guest
    #[must_use]
    pub fn guest() -> Self {
        Self(format!("guest-{}", Uuid::new_v4()))
    }

    /// Whether this identifier was generated for a guest
    #[must_use]
    pub fn is_guest(&self) -> bool {
        self.0.starts_with("guest-")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_ids_serialize_as_strings() {
        let id = ProducerId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));

        let back: ProducerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(PeerId::new(), PeerId::new());
        assert_ne!(RoomId::generate(), RoomId::generate());
    }

    #[test]
    fn test_guest_user_id() {
        let guest = UserId::guest();
        assert!(guest.is_guest());
        assert!(!UserId::from("user-42").is_guest());
    }

    #[test]
    fn test_parse_meeting_id() {
        let id = MeetingId::new();
        let parsed: MeetingId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<MeetingId>().is_err());
    }
}
