//! Branded ID newtypes for type safety.
//!
//! Teams, users and connections are all identified by strings on the wire.
//! Wrapping each in its own newtype prevents passing a user ID where a team
//! ID is expected, which matters because the registry indexes by both.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
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
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Team identifier; every session of the same team shares one group.
    TeamId
}

branded_id! {
    /// User identifier, unique within a team.
    UserId
}

branded_id! {
    /// Identifier of one accepted transport connection.
    ConnectionId
}

impl ConnectionId {
    /// Create a new random connection ID (`conn_` + UUID v7, time-ordered).
    #[must_use]
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("conn_"));
    }

    #[test]
    fn team_id_from_str() {
        let id = TeamId::from("t1");
        assert_eq!(id.as_str(), "t1");
        assert_eq!(id.to_string(), "t1");
    }

    #[test]
    fn user_id_into_string() {
        let id = UserId::from_string("u1".to_string());
        let s: String = id.into();
        assert_eq!(s, "u1");
    }

    #[test]
    fn serde_is_transparent() {
        let id = TeamId::from("team-a");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"team-a\"");
        let back: TeamId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn map_lookup_by_str() {
        let mut map = HashMap::new();
        let _ = map.insert(UserId::from("u1"), 1);
        assert_eq!(map.get("u1"), Some(&1));
    }

    #[test]
    fn deref_to_str() {
        let id = TeamId::from("abc");
        assert_eq!(id.len(), 3);
        assert!(id.starts_with('a'));
    }
}
