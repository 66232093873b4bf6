//! Per-client user identity.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier scoping session creation and queries.
///
/// Either supplied externally or generated once and held for the lifetime
/// of the client process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap an externally supplied identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier of the form `<prefix>-<uuid>`.
    #[must_use]
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", Uuid::new_v4()))
    }

    /// Use the supplied identifier when present and non-blank, else generate one.
    #[must_use]
    pub fn or_generate(supplied: Option<String>, prefix: &str) -> Self {
        match supplied {
            Some(id) if !id.trim().is_empty() => Self::new(id.trim()),
            _ => Self::generate(prefix),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_prefixed_and_unique() {
        let a = UserId::generate("cli-user");
        let b = UserId::generate("cli-user");
        assert!(a.as_str().starts_with("cli-user-"));
        assert_ne!(a, b);
    }

    #[test]
    fn supplied_id_wins_unless_blank() {
        assert_eq!(
            UserId::or_generate(Some("u1".to_string()), "x").as_str(),
            "u1"
        );
        assert!(
            UserId::or_generate(Some("  ".to_string()), "x")
                .as_str()
                .starts_with("x-")
        );
        assert!(UserId::or_generate(None, "x").as_str().starts_with("x-"));
    }

    #[test]
    fn serializes_as_plain_string() {
        let json = serde_json::to_string(&UserId::new("u1")).unwrap();
        assert_eq!(json, "\"u1\"");
    }
}
