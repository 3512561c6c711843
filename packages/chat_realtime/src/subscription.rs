//! Subscription handles and the listener registry behind them.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::ListenerError;

/// Handle returned by `subscribe` calls.
///
/// Dropping the handle (or calling [`Subscription::unsubscribe`]) removes the
/// listener. Releasing a subscription never touches the session or the raw
/// link observer.
pub struct Subscription {
    id: u64,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(id: u64, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.release.is_some())
            .finish()
    }
}

type Entries<L> = Mutex<Vec<(u64, Arc<L>)>>;

/// Ordered set of listeners; insertion order is invocation order.
pub(crate) struct ListenerSet<L: ?Sized> {
    entries: Arc<Entries<L>>,
    next_id: AtomicU64,
}

impl<L: ?Sized + Send + Sync + 'static> ListenerSet<L> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn insert(&self, listener: Arc<L>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.entries).push((id, listener));

        let entries: Weak<Entries<L>> = Arc::downgrade(&self.entries);
        Subscription::new(id, move || {
            if let Some(entries) = entries.upgrade() {
                lock(&entries).retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Copy of the current listeners, so callbacks run without the lock held
    /// and may subscribe or unsubscribe from inside.
    pub(crate) fn snapshot(&self) -> Vec<(u64, Arc<L>)> {
        lock(&self.entries).clone()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub(crate) fn clear(&self) {
        lock(&self.entries).clear();
    }
}

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run one listener, converting both `Err` returns and panics into a
/// [`ListenerError`].
pub(crate) fn invoke_isolated<F>(id: u64, call: F) -> Result<(), ListenerError>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ListenerError::Failed {
            id,
            message: format!("{e:#}"),
        }),
        Err(payload) => Err(ListenerError::Panicked {
            id,
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Listener = dyn Fn() + Send + Sync;

    #[test]
    fn dropping_handle_removes_listener() {
        let set: ListenerSet<Listener> = ListenerSet::new();
        let sub = set.insert(Arc::new(|| {}));
        assert_eq!(set.len(), 1);
        drop(sub);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn unsubscribe_removes_only_its_own_listener() {
        let set: ListenerSet<Listener> = ListenerSet::new();
        let first = set.insert(Arc::new(|| {}));
        let second = set.insert(Arc::new(|| {}));
        let first_id = first.id();
        second.unsubscribe();

        let remaining: Vec<u64> = set.snapshot().iter().map(|(id, _)| *id).collect();
        assert_eq!(remaining, vec![first_id]);
    }

    #[test]
    fn handle_outliving_registry_is_harmless() {
        let set: ListenerSet<Listener> = ListenerSet::new();
        let sub = set.insert(Arc::new(|| {}));
        drop(set);
        sub.unsubscribe();
    }

    #[test]
    fn panics_and_errors_become_listener_errors() {
        let failed = invoke_isolated(3, || anyhow::bail!("bad payload"));
        assert!(matches!(failed, Err(ListenerError::Failed { id: 3, .. })));

        let panicked = invoke_isolated(4, || panic!("boom"));
        match panicked {
            Err(ListenerError::Panicked { id, message }) => {
                assert_eq!(id, 4);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert!(invoke_isolated(5, || Ok(())).is_ok());
    }
}
