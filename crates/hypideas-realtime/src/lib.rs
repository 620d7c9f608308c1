//! Row-change subscriptions over the realtime websocket, plus an in-process
//! feed with the same interface.

pub mod client;
pub mod error;
pub mod local;
pub mod protocol;
pub mod subscription;

pub use client::RealtimeClient;
pub use error::RealtimeError;
pub use local::LocalFeed;
pub use protocol::ChangeFilter;
pub use subscription::{Subscription, SubscriptionSlot};

/// Source of row-change subscriptions.
pub trait ChangeFeed: Send + Sync + 'static {
    fn subscribe(&self, topic: &str, filters: Vec<ChangeFilter>) -> Result<Subscription, RealtimeError>;
}
