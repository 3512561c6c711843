//! JSON-over-WebSocket realtime link.
//!
//! Frames are text messages:
//!
//! ```text
//! client -> server   {"id": 7, "method": "channel.query", "params": {...}}
//! server -> client   {"id": 7, "result": {...}}
//!                    {"id": 7, "error": {"code": "auth", "message": "..."}}
//! server -> client   {"type": "message.new", ...}          (event, no id)
//! ```
//!
//! The first request on a socket is always `connect` (id 0); its result
//! carries the backend-assigned `connection_id`. After the handshake a writer
//! task drains an outbound queue into the socket and a reader task routes
//! responses to their waiting request and events to the broadcast channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{ChannelState, RealtimeLink};
use crate::conversation::ConversationId;
use crate::error::LinkError;
use crate::event::{ConnectionId, LinkEvent, RealtimeEvent};
use crate::identity::{AuthToken, SanitizedIdentity};
use crate::subscription::lock;

const CONNECT_REQUEST_ID: u64 = 0;
const OUTBOUND_QUEUE: usize = 64;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, LinkError>>>>>;

#[derive(Debug, Serialize)]
struct RequestFrame<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct WireError {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResponseFrame {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct ConnectResult {
    connection_id: ConnectionId,
}

/// One decoded server frame.
#[derive(Debug)]
enum Incoming {
    Response {
        id: u64,
        outcome: Result<Value, LinkError>,
    },
    Event(RealtimeEvent),
}

fn decode_frame(text: &str) -> Result<Incoming, LinkError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| LinkError::Protocol(format!("bad frame: {e}")))?;

    if value.get("id").is_some() {
        let frame: ResponseFrame = serde_json::from_value(value)
            .map_err(|e| LinkError::Protocol(format!("bad response: {e}")))?;
        let outcome = match (frame.error, frame.result) {
            (Some(err), _) => Err(LinkError::from_code(&err.code, err.message)),
            (None, result) => Ok(result.unwrap_or(Value::Null)),
        };
        return Ok(Incoming::Response {
            id: frame.id,
            outcome,
        });
    }

    let event: RealtimeEvent = serde_json::from_value(value)
        .map_err(|e| LinkError::Protocol(format!("bad event: {e}")))?;
    Ok(Incoming::Event(event))
}

fn encode_request(id: u64, method: &str, params: Value) -> Result<Message, LinkError> {
    let json = serde_json::to_string(&RequestFrame { id, method, params })
        .map_err(|e| LinkError::Protocol(e.to_string()))?;
    Ok(Message::Text(json.into()))
}

fn decode_result<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, LinkError> {
    serde_json::from_value(value)
        .map_err(|e| LinkError::Protocol(format!("bad {method} result: {e}")))
}

/// Map a socket-level failure onto the link taxonomy.
fn link_error_from_ws(err: tungstenite::Error) -> LinkError {
    match err {
        tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            LinkError::Auth(format!("handshake rejected with {}", response.status()))
        }
        other => LinkError::Network(other.to_string()),
    }
}

struct LiveConnection {
    connection_id: ConnectionId,
    identity_id: String,
    outbound: mpsc::Sender<Message>,
    pending: Pending,
    cancel: CancellationToken,
}

pub struct WsLink {
    url: String,
    api_key: Option<String>,
    request_timeout: Duration,
    live: Arc<Mutex<Option<LiveConnection>>>,
    next_request: AtomicU64,
    events_tx: broadcast::Sender<LinkEvent>,
}

impl WsLink {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        request_timeout: Duration,
        event_buffer: usize,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(event_buffer.max(1));
        Self {
            url: url.into(),
            api_key,
            request_timeout,
            live: Arc::new(Mutex::new(None)),
            next_request: AtomicU64::new(CONNECT_REQUEST_ID + 1),
            events_tx,
        }
    }

    fn endpoint(&self) -> String {
        match &self.api_key {
            Some(key) => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{sep}api_key={key}", self.url)
            }
            None => self.url.clone(),
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, LinkError> {
        let (outbound, pending) = {
            let live = lock(&self.live);
            let conn = live.as_ref().ok_or(LinkError::NotConnected)?;
            (conn.outbound.clone(), conn.pending.clone())
        };

        let id = self.next_request.fetch_add(1, Ordering::SeqCst);
        let frame = encode_request(id, method, params)?;
        let (tx, rx) = oneshot::channel();
        lock(&pending).insert(id, tx);

        if outbound.send(frame).await.is_err() {
            lock(&pending).remove(&id);
            return Err(LinkError::Network("connection closed".into()));
        }
        trace!(id, method, "request sent");

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(LinkError::Network("connection closed".into())),
            Err(_) => {
                lock(&pending).remove(&id);
                Err(LinkError::Network(format!("{method} timed out")))
            }
        }
    }

    /// Send the connect frame and wait for its response on a fresh socket.
    async fn handshake<S>(
        &self,
        ws: &mut S,
        identity: &SanitizedIdentity,
        token: &AuthToken,
    ) -> Result<ConnectionId, LinkError>
    where
        S: futures::Sink<Message, Error = tungstenite::Error>
            + futures::Stream<Item = Result<Message, tungstenite::Error>>
            + Unpin,
    {
        let frame = encode_request(
            CONNECT_REQUEST_ID,
            "connect",
            json!({ "user": identity, "token": token.as_str() }),
        )?;
        ws.send(frame).await.map_err(link_error_from_ws)?;

        let wait = async {
            while let Some(msg) = ws.next().await {
                match msg.map_err(link_error_from_ws)? {
                    Message::Text(text) => match decode_frame(text.as_str())? {
                        Incoming::Response {
                            id: CONNECT_REQUEST_ID,
                            outcome,
                        } => {
                            let result: ConnectResult = decode_result("connect", outcome?)?;
                            return Ok(result.connection_id);
                        }
                        other => trace!(?other, "frame before connect response ignored"),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Err(LinkError::Network("socket closed during connect".into()))
        };

        tokio::time::timeout(self.request_timeout, wait)
            .await
            .map_err(|_| LinkError::Network("connect timed out".into()))?
    }
}

#[async_trait]
impl RealtimeLink for WsLink {
    async fn connect(
        &self,
        identity: &SanitizedIdentity,
        token: &AuthToken,
    ) -> Result<ConnectionId, LinkError> {
        let existing = lock(&self.live)
            .as_ref()
            .map(|conn| conn.identity_id.clone());
        if let Some(existing) = existing {
            if existing == identity.id {
                return Err(LinkError::AlreadyConnected);
            }
            return Err(LinkError::Protocol(format!(
                "link is connected as {existing}"
            )));
        }

        let (mut ws, _) = tokio_tungstenite::connect_async(self.endpoint())
            .await
            .map_err(link_error_from_ws)?;
        let connection_id = self.handshake(&mut ws, identity, token).await?;

        let (mut write, mut read) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        // Writer: outbound queue -> socket
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    msg = outbound_rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = write.send(msg).await {
                                debug!(error = %e, "socket write failed");
                                writer_cancel.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        // Reader: socket -> pending requests / event broadcast
        let reader_cancel = cancel.clone();
        let reader_pending = pending.clone();
        let events_tx = self.events_tx.clone();
        let live = self.live.clone();
        let reader_connection = connection_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => match decode_frame(text.as_str()) {
                            Ok(Incoming::Response { id, outcome }) => {
                                if let Some(tx) = lock(&reader_pending).remove(&id) {
                                    let _ = tx.send(outcome);
                                } else {
                                    debug!(id, "response for unknown request");
                                }
                            }
                            Ok(Incoming::Event(event)) => {
                                let _ = events_tx.send(LinkEvent {
                                    connection_id: reader_connection.clone(),
                                    event,
                                });
                            }
                            Err(e) => warn!(error = %e, "undecodable frame"),
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "socket read failed");
                            break;
                        }
                    },
                }
            }

            reader_cancel.cancel();
            for (_, tx) in lock(&reader_pending).drain() {
                let _ = tx.send(Err(LinkError::Network("connection closed".into())));
            }
            let mut live = lock(&live);
            if live
                .as_ref()
                .is_some_and(|conn| conn.connection_id == reader_connection)
            {
                *live = None;
            }
            debug!(connection = %reader_connection, "socket closed");
        });

        *lock(&self.live) = Some(LiveConnection {
            connection_id: connection_id.clone(),
            identity_id: identity.id.clone(),
            outbound,
            pending,
            cancel,
        });
        info!(identity = %identity.id, connection = %connection_id, "link connected");
        Ok(connection_id)
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        if lock(&self.live).is_none() {
            return Ok(());
        }
        // the socket is torn down even if the backend never answers
        let farewell = self.request("disconnect", json!({})).await;
        let conn = lock(&self.live).take();
        if let Some(conn) = conn {
            conn.cancel.cancel();
            info!(connection = %conn.connection_id, "link disconnected");
        }
        farewell.map(|_| ())
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        lock(&self.live)
            .as_ref()
            .map(|conn| conn.connection_id.clone())
    }

    async fn open_channel(
        &self,
        conversation: &ConversationId,
        creator: &SanitizedIdentity,
        members: &[String],
    ) -> Result<ChannelState, LinkError> {
        let value = self
            .request(
                "channel.watch",
                json!({
                    "conversation_id": conversation,
                    "created_by": creator,
                    "members": members,
                }),
            )
            .await?;
        decode_result("channel.watch", value)
    }

    async fn query_channel(
        &self,
        conversation: &ConversationId,
    ) -> Result<ChannelState, LinkError> {
        let value = self
            .request("channel.query", json!({ "conversation_id": conversation }))
            .await?;
        decode_result("channel.query", value)
    }

    async fn query_channels(&self, member_id: &str) -> Result<Vec<ChannelState>, LinkError> {
        let value = self
            .request("channels.query", json!({ "member": member_id }))
            .await?;
        decode_result("channels.query", value)
    }

    async fn mark_read(&self, conversation: &ConversationId) -> Result<(), LinkError> {
        self.request("channel.mark_read", json!({ "conversation_id": conversation }))
            .await
            .map(|_| ())
    }

    async fn send_message(
        &self,
        conversation: &ConversationId,
        text: &str,
    ) -> Result<(), LinkError> {
        self.request(
            "message.send",
            json!({ "conversation_id": conversation, "text": text }),
        )
        .await
        .map(|_| ())
    }

    async fn join_call(
        &self,
        call_id: &str,
        identity: &SanitizedIdentity,
    ) -> Result<(), LinkError> {
        self.request("call.join", json!({ "call_id": call_id, "user": identity }))
            .await
            .map(|_| ())
    }

    fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events_tx.subscribe()
    }
}
