//! Reactive index of unread-message counts per conversation.
//!
//! The index is the single source of truth the UI reads. Readers call
//! [`UnreadIndex::get`] / [`UnreadIndex::total`] and may register a listener
//! that fires after every mutation (coarse invalidation: listeners re-read the
//! keys they care about).
//!
//! Mutation is crate-private: only the channel sync worker and the
//! view-acknowledgement path write to the index.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, warn};

use crate::conversation::ConversationId;
use crate::subscription::{ListenerSet, Subscription, invoke_isolated, lock};

type Listener = dyn Fn() + Send + Sync;

/// One present entry. Absence of an entry means zero unread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreadEntry {
    pub conversation_id: ConversationId,
    pub count: u32,
}

pub struct UnreadIndex {
    /// Sparse: zero counts are never stored.
    counts: Mutex<HashMap<ConversationId, u32>>,
    listeners: ListenerSet<Listener>,
}

impl Default for UnreadIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl UnreadIndex {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            listeners: ListenerSet::new(),
        }
    }

    pub fn get(&self, conversation: &ConversationId) -> u32 {
        lock(&self.counts).get(conversation).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        lock(&self.counts).values().map(|&count| u64::from(count)).sum()
    }

    /// Present entries sorted by conversation id.
    pub fn entries(&self) -> Vec<UnreadEntry> {
        let mut entries: Vec<UnreadEntry> = lock(&self.counts)
            .iter()
            .map(|(conversation_id, &count)| UnreadEntry {
                conversation_id: conversation_id.clone(),
                count,
            })
            .collect();
        entries.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        entries
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.counts).is_empty()
    }

    /// Register a listener invoked after every mutating call.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.listeners.insert(Arc::new(listener))
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Store `count` for a conversation. Zero removes the entry.
    pub(crate) fn set_count(&self, conversation: &ConversationId, count: u32) {
        {
            let mut counts = lock(&self.counts);
            if count == 0 {
                counts.remove(conversation);
            } else {
                counts.insert(conversation.clone(), count);
            }
        }
        debug!(conversation = %conversation, count, "unread count set");
        self.notify();
    }

    /// Add one to the stored count and return the new value.
    pub(crate) fn increment(&self, conversation: &ConversationId) -> u32 {
        let count = {
            let mut counts = lock(&self.counts);
            let entry = counts.entry(conversation.clone()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };
        debug!(conversation = %conversation, count, "unread count estimated");
        self.notify();
        count
    }

    /// Drop the entry for a conversation (count becomes zero).
    pub(crate) fn clear(&self, conversation: &ConversationId) {
        let removed = lock(&self.counts).remove(conversation);
        if removed.is_some() {
            debug!(conversation = %conversation, "unread count cleared");
        }
        self.notify();
    }

    /// Replace the whole index in one mutation; zero counts are skipped.
    pub(crate) fn replace_all(&self, entries: impl IntoIterator<Item = (ConversationId, u32)>) {
        {
            let mut counts = lock(&self.counts);
            counts.clear();
            counts.extend(entries.into_iter().filter(|(_, count)| *count > 0));
        }
        self.notify();
    }

    pub(crate) fn reset(&self) {
        lock(&self.counts).clear();
        self.notify();
    }

    fn notify(&self) {
        for (id, listener) in self.listeners.snapshot() {
            let result = invoke_isolated(id, || {
                listener();
                Ok(())
            });
            if let Err(e) = result {
                warn!(error = %e, "unread listener failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn conv(peer: &str) -> ConversationId {
        ConversationId::between("me", peer)
    }

    fn assert_total_matches_entries(index: &UnreadIndex) {
        let sum: u64 = index.entries().iter().map(|e| u64::from(e.count)).sum();
        assert_eq!(index.total(), sum);
        assert!(index.entries().iter().all(|e| e.count > 0));
    }

    #[test]
    fn missing_entry_reads_as_zero() {
        let index = UnreadIndex::new();
        assert_eq!(index.get(&conv("u2")), 0);
        assert_eq!(index.total(), 0);
        assert!(index.is_empty());
    }

    #[test]
    fn total_tracks_every_mutation() {
        let index = UnreadIndex::new();
        index.set_count(&conv("a"), 3);
        assert_total_matches_entries(&index);
        index.set_count(&conv("b"), 2);
        assert_total_matches_entries(&index);
        index.increment(&conv("a"));
        assert_total_matches_entries(&index);
        index.set_count(&conv("b"), 0);
        assert_total_matches_entries(&index);
        index.clear(&conv("a"));
        assert_total_matches_entries(&index);
        index.increment(&conv("c"));
        assert_total_matches_entries(&index);

        assert_eq!(index.total(), 1);
        assert_eq!(index.get(&conv("c")), 1);
    }

    #[test]
    fn zero_count_is_not_stored() {
        let index = UnreadIndex::new();
        index.set_count(&conv("a"), 4);
        index.set_count(&conv("a"), 0);
        assert!(index.is_empty());
    }

    #[test]
    fn clear_is_idempotent() {
        let index = UnreadIndex::new();
        index.set_count(&conv("a"), 4);
        index.set_count(&conv("b"), 1);

        index.clear(&conv("a"));
        let after_once = index.entries();
        index.clear(&conv("a"));

        assert_eq!(index.entries(), after_once);
        assert_eq!(index.get(&conv("a")), 0);
        assert_eq!(index.total(), 1);
    }

    #[test]
    fn listener_fires_after_each_mutation() {
        let index = UnreadIndex::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let _sub = index.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        index.set_count(&conv("a"), 1);
        index.increment(&conv("b"));
        index.clear(&conv("a"));
        index.clear(&conv("a"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn listener_can_read_the_index() {
        let index = Arc::new(UnreadIndex::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let reader = Arc::downgrade(&index);
        let sink = seen.clone();
        let _sub = index.subscribe(move || {
            if let Some(index) = reader.upgrade() {
                sink.lock().unwrap().push(index.total());
            }
        });

        index.set_count(&conv("a"), 2);
        index.increment(&conv("a"));
        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);
    }

    #[test]
    fn released_listener_is_not_called() {
        let index = UnreadIndex::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sub = index.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        index.set_count(&conv("a"), 1);
        sub.unsubscribe();
        index.set_count(&conv("a"), 2);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(index.listener_count(), 0);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let index = UnreadIndex::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let _bad = index.subscribe(|| panic!("render failed"));
        let counter = calls.clone();
        let _good = index.subscribe(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        index.set_count(&conv("a"), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(index.get(&conv("a")), 1);
    }

    #[test]
    fn replace_all_is_sparse() {
        let index = UnreadIndex::new();
        index.set_count(&conv("stale"), 9);
        index.replace_all([(conv("a"), 3), (conv("b"), 0)]);

        assert_eq!(
            index.entries(),
            vec![UnreadEntry {
                conversation_id: conv("a"),
                count: 3
            }]
        );
    }
}
