use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// String-backed ID newtype with a fixed prefix. UUIDv7 payloads keep IDs
/// sortable by creation time.
macro_rules! branded_id {
    ($(#[$doc:meta])* $name:ident => $prefix:literal) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new() -> Self {
                Self(format!("{}_{}", Self::PREFIX, Uuid::now_v7()))
            }

            /// Wrap an existing raw identifier without validation.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self::from_raw(s))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }
    };
}

branded_id!(
    /// One conversation, shared by every device that syncs it.
    ConversationId => "conv"
);
branded_id!(MessageId => "msg");
branded_id!(
    /// One coding session within a conversation.
    SessionId => "sess"
);
branded_id!(DeviceId => "dev");
branded_id!(SnapshotId => "snap");
branded_id!(DeltaId => "delta");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_carry_their_prefix() {
        assert!(ConversationId::new().as_str().starts_with("conv_"));
        assert!(MessageId::new().as_str().starts_with("msg_"));
        assert!(SessionId::new().as_str().starts_with("sess_"));
        assert!(DeviceId::new().as_str().starts_with("dev_"));
        assert!(SnapshotId::new().as_str().starts_with("snap_"));
        assert!(DeltaId::new().as_str().starts_with("delta_"));
    }

    #[test]
    fn prefix_const_matches_generated_ids() {
        assert_eq!(ConversationId::PREFIX, "conv");
        let id = ConversationId::new();
        assert!(id.as_str().starts_with(ConversationId::PREFIX));
    }

    #[test]
    fn successive_ids_differ() {
        assert_ne!(ConversationId::new(), ConversationId::new());
    }

    #[test]
    fn parse_round_trips_through_display() {
        let id = ConversationId::new();
        let parsed: ConversationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_is_transparent() {
        let id = SessionId::from_raw("sess_fixed");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""sess_fixed""#);
        let back: SessionId = serde_json::from_str(r#""sess_fixed""#).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = DeviceId::from_raw("custom-id-123");
        assert_eq!(id.as_str(), "custom-id-123");
    }

    #[test]
    fn generated_ids_sort_by_creation() {
        let ids: Vec<MessageId> = (0..64).map(|_| MessageId::new()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0].as_str() < pair[1].as_str());
        }
    }
}
