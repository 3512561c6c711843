//! Realtime events consumed from the link.
//!
//! Wire shape (JSON, tagged by `type`):
//!
//! ```json
//! { "type": "message.new", "sender": { "id": "u2", "name": "Bob" },
//!   "conversation_id": "u1-u2", "message_id": "m-17" }
//! { "type": "channel.updated", "conversation_id": "messaging:u1-u2",
//!   "server_unread_count": 3 }
//! ```
//!
//! Unknown event types decode to [`RealtimeEvent::Unknown`] and are ignored
//! by every consumer.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::conversation::ConversationId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSender {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Payload shared by `message.new` and `notification.message_new`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender: MessageSender,
    #[serde(deserialize_with = "channel_ref")]
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

/// Server-computed channel state pushed by `channel.updated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelUpdate {
    #[serde(deserialize_with = "channel_ref")]
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub server_unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RealtimeEvent {
    #[serde(rename = "message.new")]
    MessageNew(NewMessage),
    #[serde(rename = "notification.message_new")]
    NotificationMessageNew(NewMessage),
    #[serde(rename = "channel.updated")]
    ChannelUpdated(ChannelUpdate),
    #[serde(other)]
    Unknown,
}

impl RealtimeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageNew(_) => "message.new",
            Self::NotificationMessageNew(_) => "notification.message_new",
            Self::ChannelUpdated(_) => "channel.updated",
            Self::Unknown => "unknown",
        }
    }

    /// The message payload of either new-message event type.
    pub fn new_message(&self) -> Option<&NewMessage> {
        match self {
            Self::MessageNew(msg) | Self::NotificationMessageNew(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::MessageNew(msg) | Self::NotificationMessageNew(msg) => Some(&msg.conversation_id),
            Self::ChannelUpdated(update) => Some(&update.conversation_id),
            Self::Unknown => None,
        }
    }
}

/// Backend-assigned id of one live link connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An event as delivered by the link, tagged with the connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub connection_id: ConnectionId,
    pub event: RealtimeEvent,
}

fn channel_ref<'de, D>(deserializer: D) -> Result<ConversationId, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(ConversationId::from_channel_ref(&raw))
}

/// Bounded memory of message ids already acted on.
///
/// The backend reports one message as both `message.new` and
/// `notification.message_new`; consumers that must act once per message
/// consult this before acting. Messages without an id are always new.
pub(crate) struct RecentMessageIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentMessageIds {
    pub(crate) const DEFAULT_CAPACITY: usize = 512;

    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns true the first time a message is observed.
    pub(crate) fn first_sighting(&mut self, message: &NewMessage) -> bool {
        let Some(id) = message.message_id.as_deref() else {
            return true;
        };
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}
