//! ConnectionManager: the process's single realtime session.
//!
//! Owns the link and the `Session`. Guarantees:
//! - at most one live connection, for at most one identity;
//! - at most one connect in flight per identity: concurrent callers for the
//!   same identity await the same attempt;
//! - on identity change the old session is disconnected (best-effort) before
//!   the new connect starts.
//!
//! State machine, published on a `watch` channel:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//! Connected -> Disconnecting -> Disconnected      (handover / logout)
//! Connecting -> Disconnected                      (failure, retry allowed)
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::error::{ConnectError, LinkError};
use crate::event::ConnectionId;
use crate::identity::{AuthToken, Identity, SanitizedIdentity};
use crate::link::RealtimeLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// The live session for one identity.
#[derive(Debug, Clone)]
pub struct Session {
    /// Identity as handed to the backend (avatar already sanitized).
    pub identity: Identity,
    pub token: AuthToken,
    pub state: SessionState,
    pub connection_id: ConnectionId,
    pub connected_at: DateTime<Utc>,
}

impl Session {
    pub fn identity_id(&self) -> &str {
        &self.identity.id
    }
}

/// What the manager is doing right now.
#[derive(Debug, Clone)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting { identity_id: String },
    Connected(Session),
    Disconnecting { identity_id: String },
}

impl ConnectionStatus {
    pub fn state(&self) -> SessionState {
        match self {
            Self::Disconnected => SessionState::Disconnected,
            Self::Connecting { .. } => SessionState::Connecting,
            Self::Connected(_) => SessionState::Connected,
            Self::Disconnecting { .. } => SessionState::Disconnecting,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            Self::Connected(session) => Some(session),
            _ => None,
        }
    }
}

type ConnectOutcome = Shared<BoxFuture<'static, Result<Session, ConnectError>>>;

struct InFlight {
    identity_id: String,
    attempt: u64,
    outcome: ConnectOutcome,
}

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    in_flight: Option<InFlight>,
    next_attempt: u64,
    shut_down: bool,
}

/// Everything a connect attempt needs, detached from `&self` so the attempt
/// future is `'static` and can be shared between callers.
#[derive(Clone)]
struct Core {
    link: Arc<dyn RealtimeLink>,
    inner: Arc<Mutex<Inner>>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    connect_calls: Arc<AtomicU64>,
}

pub struct ConnectionManager {
    core: Core,
}

impl ConnectionManager {
    pub fn new(link: Arc<dyn RealtimeLink>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            core: Core {
                link,
                inner: Arc::new(Mutex::new(Inner::default())),
                status: Arc::new(status),
                connect_calls: Arc::new(AtomicU64::new(0)),
            },
        }
    }

    pub fn link(&self) -> &Arc<dyn RealtimeLink> {
        &self.core.link
    }

    /// Connect `identity`, or return the existing session for it.
    ///
    /// - Same identity already connected: returned unchanged, no network call.
    /// - Same identity already connecting: awaits that attempt.
    /// - Different identity: the old session is disconnected first.
    pub async fn ensure_connected(
        &self,
        identity: &Identity,
        token: &AuthToken,
    ) -> Result<Session, ConnectError> {
        let identity = identity.sanitized();

        let outcome = {
            let mut inner = self.core.inner.lock().await;
            if inner.shut_down {
                return Err(ConnectError::ShutDown);
            }

            self.core.drop_lost_session(&mut inner);

            if let Some(session) = &inner.session {
                if session.identity.id == identity.id && session.state == SessionState::Connected
                {
                    debug!(identity = %identity.id, "session already connected");
                    return Ok(session.clone());
                }
            }

            match &inner.in_flight {
                Some(flight) if flight.identity_id == identity.id => {
                    debug!(
                        identity = %identity.id,
                        attempt = flight.attempt,
                        "joining in-flight connect"
                    );
                    flight.outcome.clone()
                }
                _ => self.start_attempt(&mut inner, identity, token.clone()),
            }
        };

        outcome.await
    }

    /// The connected session, if any.
    pub fn current_session(&self) -> Option<Session> {
        self.core.status.borrow().session().cloned()
    }

    pub fn state(&self) -> SessionState {
        self.core.status.borrow().state()
    }

    /// Watch state transitions. The receiver starts at the current status.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.core.status.subscribe()
    }

    /// Number of connect calls issued to the link so far.
    pub fn connect_calls(&self) -> u64 {
        self.core.connect_calls.load(Ordering::SeqCst)
    }

    /// Tear down the current session (explicit logout).
    ///
    /// Waits for in-flight connects to settle first so they cannot resurrect
    /// the session afterwards. The attempt stays registered while it settles,
    /// so concurrent callers for the same identity keep joining it. Returns
    /// whether a session was torn down.
    pub async fn logout(&self) -> bool {
        loop {
            let mut inner = self.core.inner.lock().await;
            if let Some(flight) = &inner.in_flight {
                let pending = flight.outcome.clone();
                drop(inner);
                let _ = pending.await;
                continue;
            }

            let Some(session) = inner.session.take() else {
                return false;
            };
            // held across the disconnect: a connect started now would race it
            self.core.disconnect_session(&session).await;
            drop(inner);
            info!(identity = %session.identity.id, "logged out");
            return true;
        }
    }

    /// Logout and refuse further connects.
    pub async fn shutdown(&self) {
        self.core.inner.lock().await.shut_down = true;
        self.logout().await;
        debug!("connection manager shut down");
    }

    fn start_attempt(
        &self,
        inner: &mut Inner,
        identity: SanitizedIdentity,
        token: AuthToken,
    ) -> ConnectOutcome {
        inner.next_attempt += 1;
        let attempt = inner.next_attempt;
        // A connect for another identity may still be running; the new attempt
        // lets it settle and then hands the session over.
        let superseded = inner.in_flight.take().map(|flight| flight.outcome);
        let identity_id = identity.id.clone();

        // Close the delivery gate for the outgoing identity right away.
        if let Some(outgoing) = inner
            .session
            .as_ref()
            .filter(|session| session.identity.id != identity_id)
        {
            self.core.status.send_replace(ConnectionStatus::Disconnecting {
                identity_id: outgoing.identity.id.clone(),
            });
        }

        let core = self.core.clone();
        let outcome = async move { core.run_attempt(attempt, identity, token, superseded).await }
            .boxed()
            .shared();

        inner.in_flight = Some(InFlight {
            identity_id,
            attempt,
            outcome: outcome.clone(),
        });
        outcome
    }
}

impl Core {
    async fn run_attempt(
        self,
        attempt: u64,
        identity: SanitizedIdentity,
        token: AuthToken,
        superseded: Option<ConnectOutcome>,
    ) -> Result<Session, ConnectError> {
        if let Some(previous) = superseded {
            let _ = previous.await;
        }

        let previous_session = {
            let mut inner = self.inner.lock().await;
            self.drop_lost_session(&mut inner);
            inner.session.take()
        };
        if let Some(previous) = previous_session {
            if previous.identity.id == identity.id {
                let mut inner = self.inner.lock().await;
                inner.session = Some(previous.clone());
                self.finish_attempt(&mut inner, attempt);
                return Ok(previous);
            }
            info!(
                from = %previous.identity.id,
                to = %identity.id,
                "identity changed, handing over session"
            );
            self.disconnect_session(&previous).await;
        }

        self.status.send_replace(ConnectionStatus::Connecting {
            identity_id: identity.id.clone(),
        });
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        info!(identity = %identity.id, attempt, "connecting");

        let result = self.link.connect(&identity, &token).await;
        let connection = self.absorb_duplicate_connect(&identity, result);

        let mut inner = self.inner.lock().await;
        self.finish_attempt(&mut inner, attempt);

        match connection {
            Ok(connection_id) if inner.shut_down => {
                drop(inner);
                debug!(%connection_id, "connected after shutdown, disconnecting");
                if let Err(e) = self.link.disconnect().await {
                    warn!(error = %e, "disconnect after shutdown failed");
                }
                self.status.send_replace(ConnectionStatus::Disconnected);
                Err(ConnectError::ShutDown)
            }
            Ok(connection_id) => {
                let session = Session {
                    identity: identity.into_inner(),
                    token,
                    state: SessionState::Connected,
                    connection_id,
                    connected_at: Utc::now(),
                };
                inner.session = Some(session.clone());
                self.status
                    .send_replace(ConnectionStatus::Connected(session.clone()));
                info!(
                    identity = %session.identity.id,
                    connection = %session.connection_id,
                    "connected"
                );
                Ok(session)
            }
            Err(e) => {
                self.status.send_replace(ConnectionStatus::Disconnected);
                warn!(
                    identity = %identity.id,
                    error = %e,
                    retriable = e.is_retriable(),
                    "connect failed"
                );
                Err(e)
            }
        }
    }

    /// A duplicate-connect report means the link is already live for this
    /// identity; treat it as success using the link's live connection.
    fn absorb_duplicate_connect(
        &self,
        identity: &SanitizedIdentity,
        result: Result<ConnectionId, LinkError>,
    ) -> Result<ConnectionId, ConnectError> {
        match result {
            Ok(connection_id) => Ok(connection_id),
            Err(LinkError::AlreadyConnected) => {
                info!(identity = %identity.id, "backend reports identity already connected");
                self.link.connection_id().ok_or_else(|| {
                    ConnectError::Network("already connected but no live connection".into())
                })
            }
            Err(LinkError::Auth(message)) => Err(ConnectError::Auth(message)),
            Err(other) => Err(ConnectError::Network(other.to_string())),
        }
    }

    /// Forget a session whose link connection is gone (socket closed or
    /// replaced underneath us), so the next connect starts fresh.
    fn drop_lost_session(&self, inner: &mut Inner) {
        let live = self.link.connection_id();
        let Some(session) = inner
            .session
            .take_if(|session| live.as_ref() != Some(&session.connection_id))
        else {
            return;
        };

        warn!(
            identity = %session.identity.id,
            connection = %session.connection_id,
            "link connection lost, dropping session"
        );
        if inner.in_flight.is_none() {
            self.status.send_replace(ConnectionStatus::Disconnected);
        }
    }

    fn finish_attempt(&self, inner: &mut Inner, attempt: u64) {
        if inner
            .in_flight
            .as_ref()
            .is_some_and(|flight| flight.attempt == attempt)
        {
            inner.in_flight = None;
        }
    }

    /// Best-effort: failures are logged, the session is dropped regardless.
    async fn disconnect_session(&self, session: &Session) {
        self.status.send_replace(ConnectionStatus::Disconnecting {
            identity_id: session.identity.id.clone(),
        });
        if let Err(e) = self.link.disconnect().await {
            warn!(
                identity = %session.identity.id,
                error = %e,
                "disconnect failed, continuing"
            );
        }
        self.status.send_replace(ConnectionStatus::Disconnected);
    }
}
