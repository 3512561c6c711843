//! The realtime link capability.
//!
//! A link is one network connection to the realtime backend. The coordinator
//! never depends on a concrete transport; it talks to `Arc<dyn RealtimeLink>`.
//!
//! Submodules:
//! - `websocket` — JSON-over-WebSocket link used by the binary
//! - `memory` — scripted in-process backend for tests

#[cfg(test)]
pub(crate) mod memory;
pub mod websocket;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::conversation::ConversationId;
use crate::error::LinkError;
use crate::event::{ConnectionId, LinkEvent};
use crate::identity::{AuthToken, SanitizedIdentity};

/// Server view of one conversation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub conversation_id: ConversationId,
    /// Unread count for the connected identity.
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub members: Vec<String>,
}

#[async_trait]
pub trait RealtimeLink: Send + Sync {
    /// Open the connection for `identity`.
    ///
    /// Returns `LinkError::AlreadyConnected` if the backend already holds a
    /// live connection for this identity.
    async fn connect(
        &self,
        identity: &SanitizedIdentity,
        token: &AuthToken,
    ) -> Result<ConnectionId, LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;

    /// Id of the live connection, if any.
    fn connection_id(&self) -> Option<ConnectionId>;

    /// Create (if needed) and watch a conversation channel.
    async fn open_channel(
        &self,
        conversation: &ConversationId,
        creator: &SanitizedIdentity,
        members: &[String],
    ) -> Result<ChannelState, LinkError>;

    async fn query_channel(&self, conversation: &ConversationId)
    -> Result<ChannelState, LinkError>;

    /// All channels the given identity is a member of.
    async fn query_channels(&self, member_id: &str) -> Result<Vec<ChannelState>, LinkError>;

    async fn mark_read(&self, conversation: &ConversationId) -> Result<(), LinkError>;

    async fn send_message(&self, conversation: &ConversationId, text: &str)
    -> Result<(), LinkError>;

    /// Get-or-create a call and join it.
    async fn join_call(&self, call_id: &str, identity: &SanitizedIdentity)
    -> Result<(), LinkError>;

    /// Register a raw observer. Every call returns a new receiver.
    fn events(&self) -> broadcast::Receiver<LinkEvent>;
}
