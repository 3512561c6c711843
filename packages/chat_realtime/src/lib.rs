//! Realtime session and unread-notification coordinator for a chat client.
//!
//! - [`connection`] owns the single realtime session per process
//! - [`dispatcher`] fans raw link events out to independent subscribers
//! - [`unread`] is the reactive unread-count index the UI reads
//! - [`sync`] reconciles that index against the backend
//! - [`coordinator`] wires everything into one service object

pub mod config;
pub mod connection;
pub mod conversation;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod identity;
pub mod link;
pub mod notifier;
pub mod subscription;
pub mod sync;
pub mod token_source;
pub mod unread;


pub use connection::{ConnectionManager, ConnectionStatus, Session, SessionState};
pub use conversation::ConversationId;
pub use coordinator::{CoordinatorConfig, RealtimeCoordinator};
pub use error::{ConnectError, CoordinatorError, LinkError, ListenerError, TokenSourceError};
pub use identity::{AuthToken, Identity, SanitizedIdentity};
pub use link::RealtimeLink;
pub use notifier::MessageToast;
pub use subscription::Subscription;
pub use unread::UnreadIndex;
