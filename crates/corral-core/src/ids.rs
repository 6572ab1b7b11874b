use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7().simple()))
            }

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

// Engine-side identifiers. Backend-native ids (worker session ids, resumable
// conversation ids, container ids) stay plain strings so they are never
// confused with these.
branded_id!(SessionId, "sess");
branded_id!(MessageId, "msg");
branded_id!(QuestionId, "q");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes() {
        assert!(SessionId::new().as_str().starts_with("sess_"));
        assert!(MessageId::new().as_str().starts_with("msg_"));
        assert!(QuestionId::new().as_str().starts_with("q_"));
    }

    #[test]
    fn ids_are_unique_and_ordered() {
        let ids: Vec<SessionId> = (0..50).map(|_| SessionId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = SessionId::from_raw("custom-id");
        assert_eq!(id.as_str(), "custom-id");
        assert_eq!(id.to_string(), "custom-id");
    }

    #[test]
    fn serializes_transparently() {
        let id = SessionId::from_raw("sess_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"sess_1\"");
    }
}
