//! Scripted in-process backend used by tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{ChannelState, RealtimeLink};
use crate::conversation::ConversationId;
use crate::error::LinkError;
use crate::event::{ConnectionId, LinkEvent, RealtimeEvent};
use crate::identity::{AuthToken, Identity, SanitizedIdentity};
use crate::subscription::lock;

#[derive(Default)]
struct MemoryState {
    connected: Option<(String, ConnectionId)>,
    channels: HashMap<ConversationId, ChannelState>,
    connect_results: VecDeque<LinkError>,
    disconnect_results: VecDeque<LinkError>,
    query_failures: usize,
    fail_mark_read: bool,
    connect_delay: Duration,
    connect_calls: usize,
    connected_identities: Vec<Identity>,
    channel_creators: Vec<Identity>,
    call_joins: Vec<(String, Identity)>,
    sent: Vec<(ConversationId, String)>,
    ops: Vec<String>,
}

pub(crate) struct MemoryLink {
    state: Mutex<MemoryState>,
    next_connection: AtomicU64,
    events_tx: broadcast::Sender<LinkEvent>,
}

impl MemoryLink {
    pub(crate) fn new() -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(MemoryState::default()),
            next_connection: AtomicU64::new(1),
            events_tx,
        }
    }

    /// Seed a channel with members and a server-side unread count.
    pub(crate) fn set_channel(&self, conversation: &ConversationId, members: &[&str], unread: u32) {
        lock(&self.state).channels.insert(
            conversation.clone(),
            ChannelState {
                conversation_id: conversation.clone(),
                unread_count: unread,
                members: members.iter().map(|m| m.to_string()).collect(),
            },
        );
    }

    pub(crate) fn set_unread(&self, conversation: &ConversationId, unread: u32) {
        let mut state = lock(&self.state);
        if let Some(channel) = state.channels.get_mut(conversation) {
            channel.unread_count = unread;
        }
    }

    pub(crate) fn server_unread(&self, conversation: &ConversationId) -> Option<u32> {
        lock(&self.state)
            .channels
            .get(conversation)
            .map(|c| c.unread_count)
    }

    pub(crate) fn fail_next_connect(&self, err: LinkError) {
        lock(&self.state).connect_results.push_back(err);
    }

    pub(crate) fn fail_next_disconnect(&self, err: LinkError) {
        lock(&self.state).disconnect_results.push_back(err);
    }

    pub(crate) fn fail_next_queries(&self, count: usize) {
        lock(&self.state).query_failures = count;
    }

    pub(crate) fn fail_mark_read(&self) {
        lock(&self.state).fail_mark_read = true;
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        lock(&self.state).connect_delay = delay;
    }

    /// Pretend a connection for `identity_id` is already live on the backend.
    pub(crate) fn preconnect(&self, identity_id: &str) -> ConnectionId {
        let connection = self.allocate_connection();
        lock(&self.state).connected = Some((identity_id.to_string(), connection.clone()));
        connection
    }

    pub(crate) fn connect_calls(&self) -> usize {
        lock(&self.state).connect_calls
    }

    pub(crate) fn connected_identities(&self) -> Vec<Identity> {
        lock(&self.state).connected_identities.clone()
    }

    pub(crate) fn channel_creators(&self) -> Vec<Identity> {
        lock(&self.state).channel_creators.clone()
    }

    pub(crate) fn call_joins(&self) -> Vec<(String, Identity)> {
        lock(&self.state).call_joins.clone()
    }

    pub(crate) fn sent_messages(&self) -> Vec<(ConversationId, String)> {
        lock(&self.state).sent.clone()
    }

    /// Ordered log of connect/disconnect operations, e.g. `connect:u1`.
    pub(crate) fn ops(&self) -> Vec<String> {
        lock(&self.state).ops.clone()
    }

    /// Push an event on the current connection.
    pub(crate) fn emit(&self, event: RealtimeEvent) {
        let connection = lock(&self.state)
            .connected
            .as_ref()
            .map(|(_, c)| c.clone())
            .unwrap_or_else(|| ConnectionId::new("conn-none"));
        self.emit_on(connection, event);
    }

    pub(crate) fn emit_on(&self, connection_id: ConnectionId, event: RealtimeEvent) {
        let _ = self.events_tx.send(LinkEvent {
            connection_id,
            event,
        });
    }

    fn allocate_connection(&self) -> ConnectionId {
        let n = self.next_connection.fetch_add(1, Ordering::SeqCst);
        ConnectionId::new(format!("conn-{n}"))
    }

    fn require_connected(&self) -> Result<(), LinkError> {
        if lock(&self.state).connected.is_some() {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }
}

#[async_trait]
impl RealtimeLink for MemoryLink {
    async fn connect(
        &self,
        identity: &SanitizedIdentity,
        _token: &AuthToken,
    ) -> Result<ConnectionId, LinkError> {
        let delay = {
            let mut state = lock(&self.state);
            state.connect_calls += 1;
            state.connected_identities.push((**identity).clone());
            state.ops.push(format!("connect:{}", identity.id));
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = lock(&self.state).connect_results.pop_front() {
            return Err(err);
        }
        let connection = self.allocate_connection();
        lock(&self.state).connected = Some((identity.id.clone(), connection.clone()));
        Ok(connection)
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        let mut state = lock(&self.state);
        let who = state
            .connected
            .as_ref()
            .map(|(id, _)| id.clone())
            .unwrap_or_default();
        state.ops.push(format!("disconnect:{who}"));
        if let Some(err) = state.disconnect_results.pop_front() {
            return Err(err);
        }
        state.connected = None;
        Ok(())
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        lock(&self.state).connected.as_ref().map(|(_, c)| c.clone())
    }

    async fn open_channel(
        &self,
        conversation: &ConversationId,
        creator: &SanitizedIdentity,
        members: &[String],
    ) -> Result<ChannelState, LinkError> {
        self.require_connected()?;
        let mut state = lock(&self.state);
        state.channel_creators.push((**creator).clone());
        let channel = state
            .channels
            .entry(conversation.clone())
            .or_insert_with(|| ChannelState {
                conversation_id: conversation.clone(),
                unread_count: 0,
                members: members.to_vec(),
            });
        Ok(channel.clone())
    }

    async fn query_channel(
        &self,
        conversation: &ConversationId,
    ) -> Result<ChannelState, LinkError> {
        self.require_connected()?;
        let mut state = lock(&self.state);
        if state.query_failures > 0 {
            state.query_failures -= 1;
            return Err(LinkError::Network("query timed out".into()));
        }
        Ok(state
            .channels
            .get(conversation)
            .cloned()
            .unwrap_or_else(|| ChannelState {
                conversation_id: conversation.clone(),
                unread_count: 0,
                members: Vec::new(),
            }))
    }

    async fn query_channels(&self, member_id: &str) -> Result<Vec<ChannelState>, LinkError> {
        self.require_connected()?;
        let mut state = lock(&self.state);
        if state.query_failures > 0 {
            state.query_failures -= 1;
            return Err(LinkError::Network("query timed out".into()));
        }
        let mut channels: Vec<ChannelState> = state
            .channels
            .values()
            .filter(|c| c.members.iter().any(|m| m == member_id))
            .cloned()
            .collect();
        channels.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        Ok(channels)
    }

    async fn mark_read(&self, conversation: &ConversationId) -> Result<(), LinkError> {
        self.require_connected()?;
        let mut state = lock(&self.state);
        if state.fail_mark_read {
            return Err(LinkError::Network("read receipt dropped".into()));
        }
        if let Some(channel) = state.channels.get_mut(conversation) {
            channel.unread_count = 0;
        }
        Ok(())
    }

    async fn send_message(
        &self,
        conversation: &ConversationId,
        text: &str,
    ) -> Result<(), LinkError> {
        self.require_connected()?;
        lock(&self.state)
            .sent
            .push((conversation.clone(), text.to_string()));
        Ok(())
    }

    async fn join_call(
        &self,
        call_id: &str,
        identity: &SanitizedIdentity,
    ) -> Result<(), LinkError> {
        self.require_connected()?;
        lock(&self.state)
            .call_joins
            .push((call_id.to_string(), (**identity).clone()));
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events_tx.subscribe()
    }
}
