//! In-process transport between a [`Publisher`] and a [`Replicator`].
//!
//! Frames go through the same encoding a network transport would use. The
//! connection can be dropped and re-established to exercise the reconnect
//! path.
//!
//! [`Replicator`]: super::Replicator

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::message::{ChannelId, Notification};
use super::publisher::Publisher;
use super::transport::{MemorySubscriber, ReplicaTransport, Subscriber};
use crate::error::TransportError;

struct Connection {
    subscriber: Arc<MemorySubscriber>,
    channels: HashSet<ChannelId>,
}

/// Client end of an in-process connection.
pub struct LoopbackTransport {
    publisher: Publisher,
    connection: Mutex<Connection>,
}

impl LoopbackTransport {
    /// Connect to `publisher`. Pushed frames arrive on the returned
    /// receiver.
    pub fn connect(publisher: &Publisher) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (subscriber, frames) = MemorySubscriber::channel();
        let transport = Arc::new(Self {
            publisher: publisher.clone(),
            connection: Mutex::new(Connection {
                subscriber,
                channels: HashSet::new(),
            }),
        });
        (transport, frames)
    }

    /// Replace the connection with a fresh one.
    ///
    /// Subscriptions made on the old connection are forgotten on this side;
    /// the publisher drops the old subscriber once a delivery to it fails.
    /// Callers re-subscribe, typically through
    /// [`Replicator::reconnected`](super::Replicator::reconnected).
    pub fn reconnect(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (subscriber, frames) = MemorySubscriber::channel();
        let mut connection = self.connection.lock();
        connection.subscriber = subscriber;
        connection.channels.clear();
        debug!("loopback reconnected");
        frames
    }

    pub fn subscribed_channels(&self) -> usize {
        self.connection.lock().channels.len()
    }
}

impl ReplicaTransport for LoopbackTransport {
    fn fetch(&self, channel: ChannelId) -> BoxFuture<'_, Result<Notification, TransportError>> {
        Box::pin(async move {
            self.publisher
                .fetch(channel)
                .await
                .map_err(TransportError::from)
        })
    }

    fn subscribe(&self, channel: ChannelId) -> Result<(), TransportError> {
        let subscriber = self.connection.lock().subscriber.clone();
        self.publisher.subscribe(channel, subscriber)?;
        self.connection.lock().channels.insert(channel);
        Ok(())
    }

    fn unsubscribe(&self, channel: ChannelId) {
        let subscriber = {
            let mut connection = self.connection.lock();
            if !connection.channels.remove(&channel) {
                return;
            }
            connection.subscriber.id()
        };
        // The channel may already be gone; nothing left to undo then.
        let _ = self.publisher.unsubscribe(channel, subscriber);
    }
}
