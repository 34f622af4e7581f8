//! Transport Boundary
//!
//! The bridge does not own a network stack. It talks to whatever carries
//! frames through two traits:
//!
//! - [`Subscriber`]: the publisher's handle on one connected client.
//! - [`ReplicaTransport`]: the replica side's way to reach a publisher.
//!
//! [`MemorySubscriber`] is an in-process subscriber backed by an unbounded
//! channel. It encodes every notification, exactly as a socket would.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use super::message::{ChannelId, Notification};
use crate::error::TransportError;

/// Unique identifier for a subscriber.
///
/// Subscriptions are reference counted by this id: subscribing the same id
/// twice to one channel counts once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// A client connected to a publisher.
pub trait Subscriber: Send + Sync {
    fn id(&self) -> SubscriberId;

    /// Hand one notification to the client.
    ///
    /// An error means the client is gone; the publisher drops it from the
    /// channel.
    fn deliver(&self, notification: &Notification) -> Result<(), TransportError>;
}

/// How a replica reaches the publisher that owns its channel.
pub trait ReplicaTransport: Send + Sync + 'static {
    /// Request the channel's current value.
    fn fetch(&self, channel: ChannelId) -> BoxFuture<'_, Result<Notification, TransportError>>;

    /// Start receiving pushes for `channel`.
    fn subscribe(&self, channel: ChannelId) -> Result<(), TransportError>;

    fn unsubscribe(&self, channel: ChannelId);
}

/// Subscriber that writes encoded frames into an mpsc channel.
pub struct MemorySubscriber {
    id: SubscriberId,
    frames: mpsc::UnboundedSender<Vec<u8>>,
}

impl MemorySubscriber {
    /// Create a subscriber and the receiving end of its frame stream.
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (frames, receiver) = mpsc::unbounded_channel();
        let subscriber = Arc::new(Self {
            id: SubscriberId::new(),
            frames,
        });
        (subscriber, receiver)
    }
}

impl Subscriber for MemorySubscriber {
    fn id(&self) -> SubscriberId {
        self.id
    }

    fn deliver(&self, notification: &Notification) -> Result<(), TransportError> {
        let frame = notification.encode()?;
        self.frames
            .send(frame)
            .map_err(|_| TransportError::Disconnected)
    }
}
