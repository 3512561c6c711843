//! RealtimeCoordinator: the process-scoped service object.
//!
//! One coordinator per process, built with [`RealtimeCoordinator::init`] and
//! torn down with [`RealtimeCoordinator::shutdown`]. UI surfaces receive an
//! `Arc` of it and only ever hold subscriptions; dropping those never touches
//! the session, the raw observer or the sync worker.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionManager, Session};
use crate::conversation::ConversationId;
use crate::dispatcher::EventDispatcher;
use crate::error::{ConnectError, CoordinatorError};
use crate::identity::{AuthToken, Identity};
use crate::link::{ChannelState, RealtimeLink};
use crate::notifier::{self, MessageToast};
use crate::subscription::{Subscription, lock};
use crate::sync::ChannelSync;
use crate::unread::UnreadIndex;

pub const DEFAULT_PUBLIC_ORIGIN: &str = "http://localhost:5173";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Origin used to build shareable call links.
    pub public_origin: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            public_origin: DEFAULT_PUBLIC_ORIGIN.to_string(),
        }
    }
}

/// An opened conversation, as returned to the view that opened it.
#[derive(Debug, Clone)]
pub struct ConversationView {
    pub conversation_id: ConversationId,
    pub channel: ChannelState,
}

pub struct RealtimeCoordinator {
    config: CoordinatorConfig,
    connection: ConnectionManager,
    dispatcher: Arc<EventDispatcher>,
    sync: Arc<ChannelSync>,
    unread: Arc<UnreadIndex>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeCoordinator {
    /// Build the coordinator around `link`, install the raw observer and
    /// start the sync worker. Must be called from within a tokio runtime.
    pub fn init(link: Arc<dyn RealtimeLink>, config: CoordinatorConfig) -> Arc<Self> {
        let connection = ConnectionManager::new(link.clone());
        let dispatcher = Arc::new(EventDispatcher::new(connection.subscribe_status()));
        let unread = Arc::new(UnreadIndex::new());
        let sync = Arc::new(ChannelSync::new(link.clone(), unread.clone()));
        let cancel = CancellationToken::new();

        dispatcher.ensure_raw_observer_installed(&link);
        let worker = sync.clone().spawn(
            &dispatcher,
            connection.subscribe_status(),
            cancel.child_token(),
        );

        info!(origin = %config.public_origin, "realtime coordinator started");
        Arc::new(Self {
            config,
            connection,
            dispatcher,
            sync,
            unread,
            cancel,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Connect `identity` (or keep the existing session for it).
    pub async fn connect(
        &self,
        identity: &Identity,
        token: &AuthToken,
    ) -> Result<Session, ConnectError> {
        self.connection.ensure_connected(identity, token).await
    }

    /// Explicit logout. Returns whether a session was torn down.
    pub async fn logout(&self) -> bool {
        self.connection.logout().await
    }

    pub fn current_session(&self) -> Option<Session> {
        self.connection.current_session()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn unread(&self) -> &Arc<UnreadIndex> {
        &self.unread
    }

    /// New-message toasts for the current identity, one per message.
    pub fn on_new_message<F>(&self, on_toast: F) -> Subscription
    where
        F: Fn(MessageToast) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        notifier::subscribe(&self.dispatcher, self.connection.subscribe_status(), on_toast)
    }

    /// Open the one-to-one conversation with `peer_id`.
    ///
    /// The unread entry is cleared as soon as the channel is open; the read
    /// receipt is sent afterwards and its failure does not restore the count.
    pub async fn open_conversation(
        &self,
        peer_id: &str,
    ) -> Result<ConversationView, CoordinatorError> {
        let session = self
            .connection
            .current_session()
            .ok_or(CoordinatorError::NotConnected)?;
        let local = session.identity.sanitized();
        let conversation_id = ConversationId::between(&local.id, peer_id);
        let members = vec![local.id.clone(), peer_id.to_string()];

        let channel = self
            .connection
            .link()
            .open_channel(&conversation_id, &local, &members)
            .await?;

        self.acknowledge_view(&conversation_id);
        if let Err(e) = self.connection.link().mark_read(&conversation_id).await {
            warn!(conversation = %conversation_id, error = %e, "read receipt failed");
        }

        debug!(conversation = %conversation_id, "conversation opened");
        Ok(ConversationView {
            conversation_id,
            channel,
        })
    }

    /// The user is looking at `conversation`; clear its unread entry now.
    pub fn acknowledge_view(&self, conversation: &ConversationId) {
        self.sync.acknowledge_view(conversation);
    }

    /// Start (or join) the video call for `conversation` and announce it.
    ///
    /// The call id is the conversation id. Returns the shareable call URL.
    pub async fn start_call(
        &self,
        conversation: &ConversationId,
    ) -> Result<String, CoordinatorError> {
        let session = self
            .connection
            .current_session()
            .ok_or(CoordinatorError::NotConnected)?;
        let link = self.connection.link();

        link.join_call(conversation.as_str(), &session.identity.sanitized())
            .await?;

        let url = self.call_url(conversation);
        let text = format!("I've started a video call. Join me here: {url}");
        link.send_message(conversation, &text).await?;

        info!(conversation = %conversation, "video call started");
        Ok(url)
    }

    pub fn call_url(&self, conversation: &ConversationId) -> String {
        format!(
            "{}/call/{}",
            self.config.public_origin.trim_end_matches('/'),
            conversation
        )
    }

    /// Tear down the session, stop the raw observer and the sync worker.
    pub async fn shutdown(&self) {
        self.connection.shutdown().await;
        self.cancel.cancel();
        self.dispatcher.shutdown();

        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "sync worker ended abnormally");
            }
        }
        self.unread.reset();
        info!("realtime coordinator stopped");
    }
}
