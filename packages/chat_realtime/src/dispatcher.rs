//! EventDispatcher: one raw link observer, many logical subscribers.
//!
//! The raw observer is installed at most once per process, no matter how many
//! UI surfaces subscribe. Each event is delivered to every matching subscriber
//! in registration order. A subscriber that fails or panics is logged and
//! skipped; the rest still receive the event.
//!
//! Events are gated on the session: anything that did not arrive on the
//! current session's connection is dropped.

use std::sync::{Arc, OnceLock, Weak};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::ConnectionStatus;
use crate::event::{LinkEvent, RealtimeEvent};
use crate::link::RealtimeLink;
use crate::subscription::{ListenerSet, Subscription, invoke_isolated};

type Predicate = dyn Fn(&RealtimeEvent) -> bool + Send + Sync;
type Callback = dyn Fn(&LinkEvent) -> anyhow::Result<()> + Send + Sync;

struct Subscriber {
    predicate: Box<Predicate>,
    callback: Box<Callback>,
}

/// Result of dispatching one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub delivered: usize,
    pub failed: usize,
    /// The event did not belong to the live session.
    pub dropped: bool,
}

pub struct EventDispatcher {
    subscribers: ListenerSet<Subscriber>,
    status: watch::Receiver<ConnectionStatus>,
    observer: OnceLock<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl EventDispatcher {
    pub fn new(status: watch::Receiver<ConnectionStatus>) -> Self {
        Self {
            subscribers: ListenerSet::new(),
            status,
            observer: OnceLock::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Install the raw observer on `link` unless one is already installed.
    ///
    /// Returns true only for the call that installed it. Must be called from
    /// within a tokio runtime.
    pub fn ensure_raw_observer_installed(self: &Arc<Self>, link: &Arc<dyn RealtimeLink>) -> bool {
        let mut installed = false;
        self.observer.get_or_init(|| {
            installed = true;
            let rx = link.events();
            let dispatcher = Arc::downgrade(self);
            let cancel = self.cancel.clone();
            info!("installing raw link observer");
            tokio::spawn(run_observer(dispatcher, rx, cancel))
        });
        installed
    }

    pub fn is_observer_installed(&self) -> bool {
        self.observer.get().is_some()
    }

    /// Register a subscriber; `callback` runs for every event `predicate`
    /// accepts, for as long as the returned handle is alive.
    pub fn subscribe<P, C>(&self, predicate: P, callback: C) -> Subscription
    where
        P: Fn(&RealtimeEvent) -> bool + Send + Sync + 'static,
        C: Fn(&LinkEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let subscription = self.subscribers.insert(Arc::new(Subscriber {
            predicate: Box::new(predicate),
            callback: Box::new(callback),
        }));
        debug!(subscriber = subscription.id(), "subscriber registered");
        subscription
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver one event to every matching subscriber, in registration order.
    pub fn dispatch(&self, event: &LinkEvent) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();

        if !self.belongs_to_live_session(event) {
            trace!(
                kind = event.event.kind(),
                connection = %event.connection_id,
                "dropping event from stale connection"
            );
            outcome.dropped = true;
            return outcome;
        }

        for (id, subscriber) in self.subscribers.snapshot() {
            if !(subscriber.predicate)(&event.event) {
                continue;
            }
            match invoke_isolated(id, || (subscriber.callback)(event)) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    warn!(kind = event.event.kind(), error = %e, "subscriber failed");
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    /// Stop the raw observer and drop all subscribers.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.subscribers.clear();
    }

    fn belongs_to_live_session(&self, event: &LinkEvent) -> bool {
        match &*self.status.borrow() {
            ConnectionStatus::Connected(session) => session.connection_id == event.connection_id,
            _ => false,
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_observer(
    dispatcher: Weak<EventDispatcher>,
    mut rx: broadcast::Receiver<LinkEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => {
                    let Some(dispatcher) = dispatcher.upgrade() else {
                        break;
                    };
                    dispatcher.dispatch(&event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "raw observer lagged, events lost");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("link event stream closed");
                    break;
                }
            },
        }
    }
    debug!("raw link observer stopped");
}
