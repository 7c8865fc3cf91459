use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifiers issued by systems outside this process. They are opaque:
/// we only carry them around and compare them.
macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

opaque_id!(UserId);
opaque_id!(ChannelSessionId);
opaque_id!(ContactId);
opaque_id!(CaseId);
opaque_id!(ChatSessionId);

/// Separator between the user and session halves of a conversation key.
pub const KEY_SEPARATOR: char = ':';

/// Stable `(user, session)` identifier for one bridged conversation.
/// Used as the registry key and the durable-store key.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn new(user_id: &UserId, session_id: &ChannelSessionId) -> Self {
        Self(format!("{}{}{}", user_id, KEY_SEPARATOR, session_id))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The user half of the key. `None` unless the key holds exactly one
    /// separator; anything else cannot be split back into its two ids.
    pub fn user_part(&self) -> Option<&str> {
        let (user, session) = self.0.split_once(KEY_SEPARATOR)?;
        if session.contains(KEY_SEPARATOR) {
            return None;
        }
        Some(user)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConversationKey {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl AsRef<str> for ConversationKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
