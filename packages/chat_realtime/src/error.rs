//! Error types for the realtime layer and the coordinator built on top of it.

/// Failures reported by a [`RealtimeLink`](crate::link::RealtimeLink).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("network failure: {0}")]
    Network(String),

    /// The backend already holds a live connection for this identity.
    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl LinkError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Auth(_) => "auth",
            Self::Network(_) => "network",
            Self::AlreadyConnected => "already_connected",
            Self::NotConnected => "not_connected",
            Self::Protocol(_) => "protocol",
        }
    }

    /// Map a wire error code back onto the taxonomy.
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            "auth" => Self::Auth(message),
            "already_connected" => Self::AlreadyConnected,
            "not_connected" => Self::NotConnected,
            "network" => Self::Network(message),
            _ => Self::Protocol(format!("{code}: {message}")),
        }
    }
}

/// Error returned by `ConnectionManager::ensure_connected`.
///
/// A duplicate-connect report from the backend is absorbed as success and never
/// shows up here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("connection manager is shut down")]
    ShutDown,
}

impl ConnectError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Auth(_) => "auth",
            Self::Network(_) => "network",
            Self::ShutDown => "shut_down",
        }
    }

    /// Auth failures need a fresh token before another attempt makes sense.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// A subscriber callback failed while handling an event.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ListenerError {
    #[error("listener {id} failed: {message}")]
    Failed { id: u64, message: String },

    #[error("listener {id} panicked: {message}")]
    Panicked { id: u64, message: String },
}

/// Failures while fetching identity and token from the auth collaborator.
#[derive(Debug, thiserror::Error)]
pub enum TokenSourceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("invalid base url: {0}")]
    InvalidUrl(String),
}

/// Errors from the coordinator's conversation-level operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinatorError {
    #[error("no active session")]
    NotConnected,

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Link(#[from] LinkError),
}
