//! Deterministic conversation identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Joins the two sorted participant ids.
pub const SEPARATOR: char = '-';

/// Channel type prefix the backend puts in front of full channel references.
const CHANNEL_TYPE_PREFIX: &str = "messaging:";

/// Identifier of a two-party conversation.
///
/// Either participant can compute it locally: `between(a, b) == between(b, a)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Lexicographically sorted pair of participant ids joined by [`SEPARATOR`].
    pub fn between(a: &str, b: &str) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{low}{SEPARATOR}{high}"))
    }

    /// Wrap an id reported by the backend as-is.
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse either a bare id or a typed channel reference (`messaging:<id>`).
    pub fn from_channel_ref(channel_ref: &str) -> Self {
        let id = channel_ref
            .strip_prefix(CHANNEL_TYPE_PREFIX)
            .unwrap_or(channel_ref);
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConversationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
