//! Task and agent identifier types.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

const MAX_ID_LEN: usize = 128;

fn validate_identifier(kind: &'static str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::InvalidIdentifier {
            kind,
            id: id.into(),
            reason: "identifier cannot be empty".into(),
        });
    }

    if id.len() > MAX_ID_LEN {
        return Err(Error::InvalidIdentifier {
            kind,
            id: id.into(),
            reason: format!("identifier length must be <= {MAX_ID_LEN}"),
        });
    }

    if id.chars().any(char::is_control) {
        return Err(Error::InvalidIdentifier {
            kind,
            id: id.escape_debug().to_string(),
            reason: "identifier must not contain control characters".into(),
        });
    }

    Ok(())
}

macro_rules! string_identifier {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier after validating its format.
            ///
            /// # Errors
            ///
            /// Returns [`Error::InvalidIdentifier`] if the identifier is empty,
            /// too long, or contains control characters.
            pub fn new(id: impl Into<String>) -> Result<Self> {
                let id = id.into();
                validate_identifier($kind, &id)?;
                Ok(Self(id))
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(value: &str) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                Self::new(raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

string_identifier!(
    /// Identifier of a task whose context lives in short-term memory.
    TaskId,
    "task"
);

string_identifier!(
    /// Identifier of an agent (conversation, task-creation, or coordination component).
    AgentId,
    "agent"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays() {
        let id: TaskId = "invoice-2024-001".parse().expect("parse");
        assert_eq!(id.to_string(), "invoice-2024-001");
        assert_eq!(id.as_str(), "invoice-2024-001");
    }

    #[test]
    fn rejects_blank_identifiers() {
        let err = AgentId::new("   ").expect_err("blank id should fail");
        assert!(matches!(err, Error::InvalidIdentifier { kind: "agent", .. }));
    }

    #[test]
    fn rejects_oversized_and_control_characters() {
        assert!(TaskId::new("x".repeat(MAX_ID_LEN + 1)).is_err());
        assert!(TaskId::new("bad\nid").is_err());
        assert!(TaskId::new("x".repeat(MAX_ID_LEN)).is_ok());
    }

    #[test]
    fn deserialization_validates() {
        let id: AgentId = serde_json::from_str("\"A1\"").unwrap();
        assert_eq!(id.as_str(), "A1");
        assert!(serde_json::from_str::<AgentId>("\"\"").is_err());
    }
}
