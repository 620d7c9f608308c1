use tokio::sync::mpsc;
use tracing::debug;

use hypideas_types::events::RawChange;

use crate::ChangeFeed;
use crate::error::RealtimeError;
use crate::protocol::ChangeFilter;

type Release = Box<dyn FnOnce() + Send>;

/// A live subscription to row changes. Dropping it leaves the channel.
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<RawChange>,
    release: Option<Release>,
}

impl Subscription {
    pub fn new(
        topic: &str,
        rx: mpsc::UnboundedReceiver<RawChange>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            rx,
            release: Some(Box::new(release)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next change, or `None` once the feed is gone.
    pub async fn recv(&mut self) -> Option<RawChange> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RawChange> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            debug!("Releasing subscription to {}", self.topic);
            release();
        }
    }
}

/// Holds at most one subscription. Replacing it always releases the old
/// one before the new one is acquired.
#[derive(Default)]
pub struct SubscriptionSlot {
    current: Option<Subscription>,
}

impl SubscriptionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace<F: ChangeFeed + ?Sized>(
        &mut self,
        feed: &F,
        topic: &str,
        filters: Vec<ChangeFilter>,
    ) -> Result<&mut Subscription, RealtimeError> {
        self.release();
        let sub = feed.subscribe(topic, filters)?;
        Ok(self.current.insert(sub))
    }

    pub fn release(&mut self) {
        self.current.take();
    }

    pub fn current(&mut self) -> Option<&mut Subscription> {
        self.current.as_mut()
    }

    pub fn topic(&self) -> Option<&str> {
        self.current.as_ref().map(Subscription::topic)
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }
}
