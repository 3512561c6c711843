//! MessageNotifier: turns incoming messages from other people into toasts.
//!
//! The notifier only observes; it never touches the unread index. A message is
//! toasted once even when the backend reports it under both new-message event
//! types.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::connection::ConnectionStatus;
use crate::conversation::ConversationId;
use crate::dispatcher::EventDispatcher;
use crate::event::{NewMessage, RecentMessageIds};
use crate::subscription::{Subscription, lock};

const FALLBACK_SENDER_NAME: &str = "Someone";

/// A transient notification for one incoming message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageToast {
    pub conversation_id: ConversationId,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
}

impl MessageToast {
    pub fn for_message(message: &NewMessage) -> Self {
        let sender_name = message
            .sender
            .name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(FALLBACK_SENDER_NAME)
            .to_string();
        Self {
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender.id.clone(),
            text: format!("New message from {sender_name}"),
            sender_name,
        }
    }
}

/// Register `on_toast` for every new message not sent by the local identity.
///
/// Toasts are delivered synchronously from the dispatcher. The returned
/// subscription removes the callback when dropped.
pub fn subscribe<F>(
    dispatcher: &EventDispatcher,
    status: watch::Receiver<ConnectionStatus>,
    on_toast: F,
) -> Subscription
where
    F: Fn(MessageToast) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let recent = Mutex::new(RecentMessageIds::new(RecentMessageIds::DEFAULT_CAPACITY));

    dispatcher.subscribe(
        |event| event.new_message().is_some(),
        move |link_event| {
            let Some(message) = link_event.event.new_message() else {
                return Ok(());
            };
            let local_id = status
                .borrow()
                .session()
                .map(|session| session.identity.id.clone());
            if local_id.as_deref() == Some(message.sender.id.as_str()) {
                return Ok(());
            }
            if !lock(&recent).first_sighting(message) {
                debug!(conversation = %message.conversation_id, "duplicate message, no toast");
                return Ok(());
            }
            on_toast(MessageToast::for_message(message))
        },
    )
}

/// Convenience sink that collects toasts, for embedders without a UI loop.
#[derive(Debug, Default, Clone)]
pub struct ToastLog {
    toasts: Arc<Mutex<Vec<MessageToast>>>,
}

impl ToastLog {
    pub fn push(&self, toast: MessageToast) {
        lock(&self.toasts).push(toast);
    }

    pub fn drain(&self) -> Vec<MessageToast> {
        std::mem::take(&mut *lock(&self.toasts))
    }
}
