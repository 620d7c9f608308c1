use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;
use tracing::trace;

use hypideas_types::events::RawChange;

use crate::ChangeFeed;
use crate::error::RealtimeError;
use crate::protocol::ChangeFilter;
use crate::subscription::Subscription;

struct Entry {
    id: u64,
    topic: String,
    filters: Vec<ChangeFilter>,
    tx: mpsc::UnboundedSender<RawChange>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: Vec<Entry>,
}

/// In-process change feed. Every published change is delivered to each
/// subscription with a matching filter.
#[derive(Clone, Default)]
pub struct LocalFeed {
    inner: Arc<Mutex<Inner>>,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LocalFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many subscriptions received the change.
    pub fn publish(&self, change: RawChange) -> usize {
        let mut inner = lock(&self.inner);
        inner.entries.retain(|e| !e.tx.is_closed());
        let mut delivered = 0;
        for entry in &inner.entries {
            if entry.filters.iter().any(|f| f.matches(&change)) && entry.tx.send(change.clone()).is_ok() {
                trace!("Delivered {} change to {}", change.table, entry.topic);
                delivered += 1;
            }
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn topics(&self) -> Vec<String> {
        lock(&self.inner).entries.iter().map(|e| e.topic.clone()).collect()
    }
}

impl ChangeFeed for LocalFeed {
    fn subscribe(&self, topic: &str, filters: Vec<ChangeFilter>) -> Result<Subscription, RealtimeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = lock(&self.inner);
            inner.next_id += 1;
            let id = inner.next_id;
            inner.entries.push(Entry {
                id,
                topic: topic.to_string(),
                filters,
                tx,
            });
            id
        };

        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(topic, rx, move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).entries.retain(|e| e.id != id);
            }
        }))
    }
}
