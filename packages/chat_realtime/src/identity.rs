//! Logged-in identity and the avatar size policy applied before it reaches the
//! realtime backend.

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

/// Prefix of an inline-encoded image payload (`data:image/png;base64,...`).
pub const INLINE_IMAGE_PREFIX: &str = "data:image";

/// The logged-in user as supplied by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: String,
}

impl Identity {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        avatar_ref: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_ref: avatar_ref.into(),
        }
    }

    /// Copy of this identity that is safe to hand to the realtime layer.
    ///
    /// Inline image payloads exceed the backend's per-field limit and make
    /// connect/join fail, so they are replaced with an empty avatar.
    pub fn sanitized(&self) -> SanitizedIdentity {
        let avatar_ref = if is_inline_image(&self.avatar_ref) {
            String::new()
        } else {
            self.avatar_ref.clone()
        };
        SanitizedIdentity(Identity {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            avatar_ref,
        })
    }
}

pub fn is_inline_image(avatar_ref: &str) -> bool {
    avatar_ref.starts_with(INLINE_IMAGE_PREFIX)
}

/// An [`Identity`] whose avatar has passed the size policy.
///
/// Only [`Identity::sanitized`] constructs one, and every link operation that
/// carries identity data takes this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SanitizedIdentity(Identity);

impl SanitizedIdentity {
    pub fn into_inner(self) -> Identity {
        self.0
    }
}

impl Deref for SanitizedIdentity {
    type Target = Identity;

    fn deref(&self) -> &Identity {
        &self.0
    }
}

/// Opaque bearer token for the realtime backend.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_avatar_is_stripped() {
        let identity = Identity::new("u1", "Ada", "data:image/png;base64,iVBORw0KGgo=");
        let safe = identity.sanitized();
        assert_eq!(safe.avatar_ref, "");
        assert_eq!(safe.id, "u1");
        assert_eq!(safe.display_name, "Ada");
        // the caller's copy is untouched
        assert!(identity.avatar_ref.starts_with("data:image"));
    }

    #[test]
    fn url_avatar_is_kept() {
        let identity = Identity::new("u1", "Ada", "https://cdn.example.com/ada.png");
        assert_eq!(
            identity.sanitized().avatar_ref,
            "https://cdn.example.com/ada.png"
        );
    }

    #[test]
    fn empty_avatar_stays_empty() {
        let identity = Identity::new("u1", "Ada", "");
        assert_eq!(identity.sanitized().into_inner(), identity);
    }

    #[test]
    fn token_debug_is_redacted() {
        let token = AuthToken::new("secret-bearer");
        assert_eq!(format!("{token:?}"), "AuthToken(***)");
        assert_eq!(token.as_str(), "secret-bearer");
    }
}
