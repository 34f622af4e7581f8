//! Publisher
//!
//! Exposes cached computations as channels that remote clients subscribe
//! to.
//!
//! # Flow
//!
//! 1. `publish(node)` creates (or returns) the node's channel. The channel
//!    observes the node's invalidations.
//! 2. Clients `subscribe`. Subscriptions are counted per subscriber id.
//! 3. When the node is invalidated and the channel has subscribers, the
//!    channel's [`UpdateDelayer`] opens a window.
//! 4. When the window closes the channel reads the node's current value
//!    (recomputing it if needed) and sends one [`Notification`] to every
//!    subscriber.
//!
//! Delivery is best effort: a subscriber whose delivery fails is dropped
//! from the channel and has to subscribe again. The last explicit
//! `unsubscribe` disposes the channel; the node itself is never touched.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::delayer::{DelayerState, UpdateDelayer};
use super::message::{ChannelId, Notification};
use super::transport::{Subscriber, SubscriberId};
use crate::config::DelayConfig;
use crate::error::PublisherError;
use crate::graph::{InvalidationObserver, NodeId, ObserverId};
use crate::reactive::{CacheKey, CacheValue, ComputationNode};

/// What a channel needs from the node it publishes.
pub(crate) trait PublishedNode: Send + Sync + 'static {
    fn node_id(&self) -> NodeId;

    fn current_version(&self) -> u64;

    /// Read the current output (recomputing if needed) as a notification.
    fn snapshot(self: Arc<Self>, channel: ChannelId)
        -> BoxFuture<'static, Result<Notification, PublisherError>>;

    fn attach(&self, observer: Weak<dyn InvalidationObserver>) -> ObserverId;

    fn detach(&self, observer: ObserverId);
}

impl<K, V> PublishedNode for ComputationNode<K, V>
where
    K: CacheKey,
    V: CacheValue + Serialize,
{
    fn node_id(&self) -> NodeId {
        self.id()
    }

    fn current_version(&self) -> u64 {
        self.version()
    }

    fn snapshot(
        self: Arc<Self>,
        channel: ChannelId,
    ) -> BoxFuture<'static, Result<Notification, PublisherError>> {
        Box::pin(async move {
            let (output, version) = self.get_untracked().await;
            match output {
                Ok(value) => Notification::value(channel, version, &value)
                    .map_err(|e| PublisherError::Encode(e.to_string())),
                Err(error) => Ok(Notification::error(channel, version, error)),
            }
        })
    }

    fn attach(&self, observer: Weak<dyn InvalidationObserver>) -> ObserverId {
        self.observe(observer)
    }

    fn detach(&self, observer: ObserverId) {
        self.unobserve(observer)
    }
}

/// One published node and the subscribers listening to it.
pub struct Channel {
    id: ChannelId,
    category: Option<String>,
    node: Arc<dyn PublishedNode>,
    subscribers: Mutex<IndexMap<SubscriberId, Arc<dyn Subscriber>>>,
    delayer: Arc<UpdateDelayer>,
    observer: Mutex<Option<ObserverId>>,
    pushes: AtomicU64,
}

impl Channel {
    fn open(
        node: Arc<dyn PublishedNode>,
        category: Option<String>,
        config: &DelayConfig,
        runtime: Handle,
    ) -> Arc<Self> {
        let policy = config.policy(category.as_deref());
        let channel = Arc::new_cyclic(|weak: &Weak<Channel>| {
            let weak = weak.clone();
            let delayer = UpdateDelayer::new(policy, runtime, move || {
                let weak = weak.clone();
                async move {
                    if let Some(channel) = weak.upgrade() {
                        channel.push().await;
                    }
                }
            });
            Channel {
                id: ChannelId::new(),
                category,
                node,
                subscribers: Mutex::new(IndexMap::new()),
                delayer,
                observer: Mutex::new(None),
                pushes: AtomicU64::new(0),
            }
        });

        let observer: Weak<dyn InvalidationObserver> =
            Arc::downgrade(&channel) as Weak<dyn InvalidationObserver>;
        *channel.observer.lock() = Some(channel.node.attach(observer));
        channel
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn node_id(&self) -> NodeId {
        self.node.node_id()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn has_subscriber(&self, id: SubscriberId) -> bool {
        self.subscribers.lock().contains_key(&id)
    }

    /// Number of pushes delivered so far.
    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    pub fn delayer_state(&self) -> DelayerState {
        self.delayer.state()
    }

    async fn push(self: Arc<Self>) {
        match Arc::clone(&self.node).snapshot(self.id).await {
            Ok(notification) => {
                self.pushes.fetch_add(1, Ordering::Relaxed);
                let delivered = self.broadcast(&notification);
                debug!(channel = %self.id, version = notification.version, delivered, "pushed");
            }
            Err(e) => warn!(channel = %self.id, error = %e, "push skipped"),
        }
    }

    /// Deliver to every subscriber, dropping the ones that fail.
    fn broadcast(&self, notification: &Notification) -> usize {
        let subscribers: Vec<Arc<dyn Subscriber>> =
            self.subscribers.lock().values().cloned().collect();

        let mut failed = Vec::new();
        for subscriber in &subscribers {
            if let Err(e) = subscriber.deliver(notification) {
                warn!(channel = %self.id, subscriber = ?subscriber.id(), error = %e, "dropping subscriber");
                failed.push(subscriber.id());
            }
        }

        if !failed.is_empty() {
            let mut current = self.subscribers.lock();
            for id in &failed {
                current.shift_remove(id);
            }
        }
        subscribers.len() - failed.len()
    }

    fn dispose(&self) {
        if let Some(observer) = self.observer.lock().take() {
            self.node.detach(observer);
        }
        self.delayer.cancel();
        self.subscribers.lock().clear();
        debug!(channel = %self.id, "channel disposed");
    }
}

impl InvalidationObserver for Channel {
    fn on_invalidated(self: Arc<Self>, _node: NodeId) {
        if self.subscriber_count() > 0 {
            self.delayer.signal();
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("node", &self.node.node_id())
            .field("subscribers", &self.subscriber_count())
            .field("delayer", &self.delayer)
            .finish()
    }
}

struct PublisherInner {
    config: DelayConfig,
    runtime: Handle,
    channels: DashMap<ChannelId, Arc<Channel>>,
    by_node: DashMap<NodeId, ChannelId>,
}

/// Server-side hub of published computations.
///
/// Cloning is cheap; clones share the same channels.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    /// Create a publisher bound to the current tokio runtime.
    pub fn new(config: DelayConfig) -> Result<Self, PublisherError> {
        let runtime = Handle::try_current().map_err(|_| PublisherError::NoRuntime)?;
        Ok(Self::with_runtime(config, runtime))
    }

    /// Create a publisher whose push timers run on `runtime`.
    pub fn with_runtime(config: DelayConfig, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                config,
                runtime,
                channels: DashMap::new(),
                by_node: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &DelayConfig {
        &self.inner.config
    }

    /// Publish `node` under the default delay.
    pub fn publish<K, V>(&self, node: &Arc<ComputationNode<K, V>>) -> Arc<Channel>
    where
        K: CacheKey,
        V: CacheValue + Serialize,
    {
        self.publish_in(node, None)
    }

    /// Publish `node` under the delay configured for `category`.
    ///
    /// Publishing a node that already has a channel returns that channel.
    pub fn publish_in<K, V>(
        &self,
        node: &Arc<ComputationNode<K, V>>,
        category: Option<&str>,
    ) -> Arc<Channel>
    where
        K: CacheKey,
        V: CacheValue + Serialize,
    {
        let entry = self.inner.by_node.entry(node.id());
        if let Entry::Occupied(existing) = &entry {
            if let Some(channel) = self.inner.channels.get(existing.get()) {
                return Arc::clone(channel.value());
            }
        }

        let published: Arc<dyn PublishedNode> = Arc::clone(node) as Arc<dyn PublishedNode>;
        let channel = Channel::open(
            published,
            category.map(str::to_owned),
            &self.inner.config,
            self.inner.runtime.clone(),
        );
        self.inner.channels.insert(channel.id(), Arc::clone(&channel));
        entry.insert(channel.id());

        debug!(channel = %channel.id(), node = %node.id(), key = ?node.key(), category, "published");
        channel
    }

    pub fn channel(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.inner.channels.get(&id).map(|c| Arc::clone(c.value()))
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// Add `subscriber` to a channel. Subscribing twice counts once.
    pub fn subscribe(
        &self,
        id: ChannelId,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<(), PublisherError> {
        let channel = self.channel(id).ok_or(PublisherError::UnknownChannel(id))?;
        let subscriber_id = subscriber.id();
        let count = {
            let mut subscribers = channel.subscribers.lock();
            subscribers.entry(subscriber_id).or_insert(subscriber);
            subscribers.len()
        };
        debug!(channel = %id, subscriber = ?subscriber_id, subscribers = count, "subscribed");
        Ok(())
    }

    /// Remove one subscriber. The last one out disposes the channel.
    ///
    /// Returns whether the subscriber was present.
    pub fn unsubscribe(&self, id: ChannelId, subscriber: SubscriberId) -> Result<bool, PublisherError> {
        let channel = self.channel(id).ok_or(PublisherError::UnknownChannel(id))?;
        let (removed, remaining) = {
            let mut subscribers = channel.subscribers.lock();
            let removed = subscribers.shift_remove(&subscriber).is_some();
            (removed, subscribers.len())
        };
        debug!(channel = %id, subscriber = ?subscriber, subscribers = remaining, "unsubscribed");

        if removed && remaining == 0 {
            self.dispose(&channel);
        }
        Ok(removed)
    }

    /// Current value of a channel's node, recomputing it if needed.
    pub async fn fetch(&self, id: ChannelId) -> Result<Notification, PublisherError> {
        let channel = self.channel(id).ok_or(PublisherError::UnknownChannel(id))?;
        Arc::clone(&channel.node).snapshot(id).await
    }

    /// Tell subscribers the channel is going away, then dispose it.
    pub fn unpublish(&self, id: ChannelId) -> Result<(), PublisherError> {
        let channel = self.channel(id).ok_or(PublisherError::UnknownChannel(id))?;
        let marker = Notification::invalidated(id, channel.node.current_version());
        channel.broadcast(&marker);
        self.dispose(&channel);
        Ok(())
    }

    fn dispose(&self, channel: &Arc<Channel>) {
        let id = channel.id();
        self.inner.channels.remove(&id);
        self.inner
            .by_node
            .remove_if(&channel.node_id(), |_, current| *current == id);
        channel.dispose();
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("channels", &self.channel_count())
            .field("config", &self.inner.config)
            .finish()
    }
}
