//! ChannelSync: keeps the [`UnreadIndex`] in step with the backend.
//!
//! Rules:
//! - server-reported counts overwrite the local value;
//! - when the server cannot be asked, a new message from someone else bumps
//!   the local count by one (estimate) and the next authoritative report
//!   corrects it;
//! - a conversation the user is viewing is cleared locally right away;
//! - the index is rebuilt from `query_channels` once per connection.
//!
//! Events are handled on a single worker task, one at a time, in arrival
//! order.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::ConnectionStatus;
use crate::conversation::ConversationId;
use crate::dispatcher::EventDispatcher;
use crate::error::LinkError;
use crate::event::{ConnectionId, LinkEvent, NewMessage, RealtimeEvent, RecentMessageIds};
use crate::link::RealtimeLink;
use crate::subscription::lock;
use crate::unread::UnreadIndex;

/// How one event changed the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Count taken from the backend.
    Authoritative(u32),
    /// Backend unreachable; count bumped locally.
    Estimated(u32),
    /// Event did not affect unread state.
    Skipped,
}

pub struct ChannelSync {
    link: Arc<dyn RealtimeLink>,
    index: Arc<UnreadIndex>,
    recent: Mutex<RecentMessageIds>,
}

impl ChannelSync {
    pub fn new(link: Arc<dyn RealtimeLink>, index: Arc<UnreadIndex>) -> Self {
        Self {
            link,
            index,
            recent: Mutex::new(RecentMessageIds::new(RecentMessageIds::DEFAULT_CAPACITY)),
        }
    }

    pub fn index(&self) -> &Arc<UnreadIndex> {
        &self.index
    }

    /// Rebuild the index from every channel `identity_id` belongs to.
    pub async fn bootstrap(&self, identity_id: &str) -> Result<usize, LinkError> {
        let channels = self.link.query_channels(identity_id).await?;
        let total = channels.len();
        self.index.replace_all(
            channels
                .into_iter()
                .map(|channel| (channel.conversation_id, channel.unread_count)),
        );
        info!(
            identity = %identity_id,
            channels = total,
            unread = self.index.total(),
            "unread index bootstrapped"
        );
        Ok(total)
    }

    /// Apply one realtime event for the local identity `local_id`.
    pub async fn handle_event(&self, local_id: &str, event: &RealtimeEvent) -> Reconciliation {
        match event {
            RealtimeEvent::MessageNew(message) | RealtimeEvent::NotificationMessageNew(message) => {
                self.handle_new_message(local_id, message).await
            }
            RealtimeEvent::ChannelUpdated(update) => {
                self.apply_server_count(&update.conversation_id, update.server_unread_count)
            }
            RealtimeEvent::Unknown => Reconciliation::Skipped,
        }
    }

    /// The user is looking at this conversation.
    pub fn acknowledge_view(&self, conversation: &ConversationId) {
        self.index.clear(conversation);
    }

    /// Forget everything (identity handover or logout).
    pub fn reset(&self) {
        lock(&self.recent).clear();
        self.index.reset();
    }

    /// Subscribe to the dispatcher and run the worker until `cancel` fires.
    pub fn spawn(
        self: Arc<Self>,
        dispatcher: &EventDispatcher,
        status: watch::Receiver<ConnectionStatus>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let (tx, rx) = mpsc::unbounded_channel::<LinkEvent>();
        let subscription = dispatcher.subscribe(
            |event| !matches!(event, RealtimeEvent::Unknown),
            move |event| {
                tx.send(event.clone())?;
                Ok(())
            },
        );

        tokio::spawn(async move {
            // held for the worker's lifetime
            let _subscription = subscription;
            self.run(status, rx, cancel).await;
        })
    }

    async fn run(
        &self,
        mut status: watch::Receiver<ConnectionStatus>,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
        cancel: CancellationToken,
    ) {
        let mut worker = Worker::default();
        worker.observe(self, &status.borrow_and_update().clone());

        loop {
            if worker.needs_bootstrap() {
                worker.bootstrap(self).await;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = status.borrow_and_update().clone();
                    worker.observe(self, &current);
                }
                received = events.recv() => {
                    let Some(event) = received else { break };
                    worker.handle(self, event).await;
                }
            }
        }
        debug!("channel sync worker stopped");
    }

    async fn handle_new_message(&self, local_id: &str, message: &NewMessage) -> Reconciliation {
        if message.sender.id == local_id {
            return Reconciliation::Skipped;
        }
        let conversation = &message.conversation_id;
        let first_sighting = lock(&self.recent).first_sighting(message);

        match self.link.query_channel(conversation).await {
            Ok(channel) => self.apply_server_count(conversation, channel.unread_count),
            Err(e) if first_sighting => {
                let count = self.index.increment(conversation);
                warn!(
                    conversation = %conversation,
                    error = %e,
                    count,
                    "channel query failed, estimating unread count"
                );
                Reconciliation::Estimated(count)
            }
            Err(e) => {
                debug!(conversation = %conversation, error = %e, "duplicate message, not estimating");
                Reconciliation::Skipped
            }
        }
    }

    fn apply_server_count(&self, conversation: &ConversationId, count: u32) -> Reconciliation {
        self.index.set_count(conversation, count);
        Reconciliation::Authoritative(count)
    }
}

/// Per-connection bookkeeping of the worker task.
#[derive(Default)]
struct Worker {
    local_id: Option<String>,
    connection: Option<ConnectionId>,
    bootstrapped: Option<ConnectionId>,
}

impl Worker {
    fn observe(&mut self, sync: &ChannelSync, status: &ConnectionStatus) {
        match status {
            ConnectionStatus::Connected(session) => {
                if self.local_id.as_deref() != Some(session.identity_id()) {
                    // a different identity never inherits counts
                    sync.reset();
                }
                self.local_id = Some(session.identity.id.clone());
                self.connection = Some(session.connection_id.clone());
            }
            ConnectionStatus::Disconnecting { .. } => {
                sync.reset();
                self.local_id = None;
                self.connection = None;
                self.bootstrapped = None;
            }
            ConnectionStatus::Connecting { .. } | ConnectionStatus::Disconnected => {
                self.connection = None;
            }
        }
    }

    fn needs_bootstrap(&self) -> bool {
        self.connection.is_some() && self.connection != self.bootstrapped
    }

    async fn bootstrap(&mut self, sync: &ChannelSync) {
        let (Some(local_id), Some(connection)) = (self.local_id.clone(), self.connection.clone())
        else {
            return;
        };
        match sync.bootstrap(&local_id).await {
            Ok(_) => self.bootstrapped = Some(connection),
            // retried on the next wake-up
            Err(e) => warn!(identity = %local_id, error = %e, "unread bootstrap failed"),
        }
    }

    async fn handle(&mut self, sync: &ChannelSync, event: LinkEvent) {
        if self.connection.as_ref() != Some(&event.connection_id) {
            debug!(connection = %event.connection_id, "event for inactive connection ignored");
            return;
        }
        let Some(local_id) = self.local_id.clone() else {
            return;
        };
        let result = sync.handle_event(&local_id, &event.event).await;
        debug!(kind = event.event.kind(), ?result, "event reconciled");
    }
}
