use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Chat-platform user identifier.
pub type UserId = i64;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
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

branded_id!(PlaceholderId, "temp");

/// Identity of a conversation session.
///
/// `Real` ids are issued by the engine and may be handed back to it as a
/// resume handle. `Placeholder` ids are minted locally before the engine has
/// answered and must never leave the process.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SessionId {
    Real(String),
    Placeholder(PlaceholderId),
}

impl SessionId {
    /// Mint a fresh placeholder.
    pub fn placeholder() -> Self {
        Self::Placeholder(PlaceholderId::new())
    }

    pub fn real(id: impl Into<String>) -> Self {
        Self::Real(id.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Real(id) => id,
            Self::Placeholder(id) => id.as_str(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder(_))
    }

    /// The id that may be forwarded to the engine, if any.
    pub fn engine_id(&self) -> Option<&str> {
        match self {
            Self::Real(id) => Some(id),
            Self::Placeholder(_) => None,
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_has_prefix() {
        let id = PlaceholderId::new();
        assert!(id.as_str().starts_with("temp_"), "got: {id}");
    }

    #[test]
    fn placeholders_are_unique() {
        assert_ne!(SessionId::placeholder(), SessionId::placeholder());
    }

    #[test]
    fn placeholder_has_no_engine_id() {
        let id = SessionId::placeholder();
        assert!(id.is_placeholder());
        assert!(id.engine_id().is_none());
    }

    #[test]
    fn real_id_is_forwardable() {
        let id = SessionId::real("3f1c-engine");
        assert!(!id.is_placeholder());
        assert_eq!(id.engine_id(), Some("3f1c-engine"));
        assert_eq!(id.to_string(), "3f1c-engine");
    }

    #[test]
    fn real_id_that_looks_like_placeholder_stays_real() {
        // Classification comes from the variant, never from the text.
        let id = SessionId::real("temp_not_really");
        assert_eq!(id.engine_id(), Some("temp_not_really"));
    }

    #[test]
    fn serde_keeps_variant() {
        let id = SessionId::placeholder();
        let json = serde_json::to_value(&id).unwrap();
        assert_eq!(json["kind"], "placeholder");
        let parsed: SessionId = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, id);

        let real = SessionId::real("abc");
        let json = serde_json::to_string(&real).unwrap();
        assert_eq!(json, r#"{"kind":"real","id":"abc"}"#);
    }
}
