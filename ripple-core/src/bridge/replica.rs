//! Replicas
//!
//! A [`Replica`] mirrors one remote computation. It is a node of the local
//! dependency graph, so a local computation that reads a replica is
//! invalidated when a newer remote value arrives.
//!
//! # Versions
//!
//! Updates can arrive out of order (a push overtaking a fetch response, or
//! pushes racing each other). The replica only ever moves forward:
//!
//! - a push is accepted if its version is strictly newer than the held one;
//! - a fetch response is accepted if it is at least as new;
//! - an invalidation marker applies if it is at least as new.
//!
//! After a reconnect the publisher may have restarted with fresh version
//! numbers, so the first value received after [`Replica::mark_reconnected`]
//! is taken as-is.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::message::{ChannelId, Notification};
use super::transport::ReplicaTransport;
use crate::error::{ComputeError, ComputeResult, ReplicaError};
use crate::graph::{
    Dependent, Edges, Graph, GraphNode, InvalidationPropagator, Mark, NodeId, NodeState,
};
use crate::reactive::{CacheValue, ComputeContext};

/// Anything a replica can hold.
pub trait ReplicaValue: CacheValue + DeserializeOwned {}

impl<T> ReplicaValue for T where T: CacheValue + DeserializeOwned {}

/// What [`Replica::apply`] did with a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A newer output was stored.
    Accepted,
    /// The replica was marked invalidated.
    Invalidated,
    /// Out of date or duplicate; nothing changed.
    Ignored,
    /// No replica exists for the channel.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Push,
    Fetch,
}

struct ReplicaInner<V> {
    output: Option<ComputeResult<V>>,
    version: u64,
    state: NodeState,
    /// Bumped on every accepted output.
    generation: u64,
    subscribed: bool,
    authoritative_next: bool,
    edges: Edges,
}

/// Client-side mirror of a published computation.
pub struct Replica<V: ReplicaValue> {
    id: NodeId,
    channel: ChannelId,
    transport: Arc<dyn ReplicaTransport>,
    inner: Mutex<ReplicaInner<V>>,
    fetching: tokio::sync::Mutex<()>,
}

impl<V: ReplicaValue> Replica<V> {
    pub fn new(channel: ChannelId, transport: Arc<dyn ReplicaTransport>) -> Arc<Self> {
        let replica = Arc::new(Self {
            id: NodeId::new(),
            channel,
            transport,
            inner: Mutex::new(ReplicaInner {
                output: None,
                version: 0,
                state: NodeState::Invalidated,
                generation: 0,
                subscribed: false,
                authoritative_next: false,
                edges: Edges::new(),
            }),
            fetching: tokio::sync::Mutex::new(()),
        });
        let weak = Arc::downgrade(&replica) as std::sync::Weak<dyn GraphNode>;
        Graph::global().register(replica.id, weak);
        replica
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn state(&self) -> NodeState {
        self.inner.lock().state
    }

    /// Version of the held output; 0 before anything arrived.
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Held output, without fetching or recording a dependency.
    pub fn peek(&self) -> Option<ComputeResult<V>> {
        self.inner.lock().output.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner.lock().subscribed
    }

    pub fn dependent_count(&self) -> usize {
        self.inner.lock().edges.dependent_count()
    }

    /// The mirrored value.
    ///
    /// A consistent replica answers locally. Otherwise one fetch is issued
    /// (concurrent callers share it). If the fetch fails, a stale value is
    /// served when there is one.
    pub async fn resolve(self: &Arc<Self>) -> ComputeResult<V> {
        if let Some(output) = self.read(false) {
            return output;
        }

        let _fetching = self.fetching.lock().await;
        if let Some(output) = self.read(false) {
            return output;
        }

        self.ensure_subscribed();
        let failure = match self.transport.fetch(self.channel).await {
            Ok(notification) => {
                self.accept(notification, Origin::Fetch);
                None
            }
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "replica fetch failed");
                Some(e)
            }
        };

        match self.read(true) {
            Some(output) => output,
            None => Err(ComputeError::Unavailable(
                failure.map_or_else(|| "no value received".to_string(), |e| e.to_string()),
            )),
        }
    }

    /// Apply a pushed notification.
    pub fn apply(self: &Arc<Self>, notification: Notification) -> ApplyOutcome {
        self.accept(notification, Origin::Push)
    }

    /// The connection was re-established.
    ///
    /// The replica is invalidated so the next read refetches, the next
    /// value is accepted whatever its version, and the subscription is
    /// renewed.
    pub fn mark_reconnected(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            inner.authoritative_next = true;
            inner.subscribed = false;
        }
        InvalidationPropagator::global().propagate(self.clone());
        self.ensure_subscribed();
        debug!(channel = %self.channel, "replica re-armed after reconnect");
    }

    /// Serve the held output, recording a dependency if a computation is
    /// running. Unless `stale_ok`, only a consistent output is served.
    fn read(self: &Arc<Self>, stale_ok: bool) -> Option<ComputeResult<V>> {
        let frame = ComputeContext::current_frame();
        let output = {
            let mut inner = self.inner.lock();
            let servable = stale_ok || inner.state == NodeState::Consistent;
            if !servable {
                return None;
            }
            if let Some(frame) = &frame {
                inner.edges.add_dependent(frame.as_dependent());
            }
            inner.output.clone()
        };

        if let Some(frame) = &frame {
            let node: Arc<dyn GraphNode> = self.clone();
            frame.record(node);
        }
        output
    }

    fn ensure_subscribed(&self) {
        if self.inner.lock().subscribed {
            return;
        }
        match self.transport.subscribe(self.channel) {
            Ok(()) => {
                self.inner.lock().subscribed = true;
                debug!(channel = %self.channel, "replica subscribed");
            }
            Err(e) => warn!(channel = %self.channel, error = %e, "replica subscribe failed"),
        }
    }

    fn accept(self: &Arc<Self>, notification: Notification, origin: Origin) -> ApplyOutcome {
        let version = notification.version;

        let Some(output) = notification.output::<V>() else {
            let current = self.inner.lock().version;
            if version < current {
                trace!(channel = %self.channel, version, current, "stale invalidation ignored");
                return ApplyOutcome::Ignored;
            }
            InvalidationPropagator::global().propagate(self.clone());
            return ApplyOutcome::Invalidated;
        };

        let dependents = {
            let mut inner = self.inner.lock();
            let newer = match origin {
                _ if inner.authoritative_next => true,
                Origin::Push => version > inner.version,
                Origin::Fetch => {
                    version > inner.version
                        || inner.output.is_none()
                        || (version == inner.version && inner.state != NodeState::Consistent)
                }
            };
            if !newer {
                trace!(channel = %self.channel, version, current = inner.version, ?origin, "update ignored");
                return ApplyOutcome::Ignored;
            }

            let changed = inner.authoritative_next || version != inner.version;
            inner.output = Some(output);
            inner.version = version;
            inner.state = NodeState::Consistent;
            inner.generation += 1;
            inner.authoritative_next = false;
            if changed {
                inner.edges.take_dependents()
            } else {
                Vec::new()
            }
        };

        let invalidated = InvalidationPropagator::global().propagate_to(dependents);
        debug!(channel = %self.channel, version, ?origin, invalidated, "replica updated");
        ApplyOutcome::Accepted
    }
}

impl<V: ReplicaValue> GraphNode for Replica<V> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn state(&self) -> NodeState {
        self.inner.lock().state
    }

    fn mark_invalidated(&self, generation: Option<u64>) -> Mark {
        let mut inner = self.inner.lock();
        if generation.is_some_and(|g| g != inner.generation) {
            return Mark::Unchanged;
        }
        match inner.state {
            NodeState::Consistent => {
                inner.state = NodeState::Invalidated;
                Mark::Invalidated(inner.edges.take_dependents())
            }
            NodeState::Invalidated | NodeState::Computing => Mark::Unchanged,
        }
    }

    fn add_dependent(&self, dependent: Dependent) {
        self.inner.lock().edges.add_dependent(dependent);
    }

    fn remove_dependent(&self, dependent: Dependent) {
        self.inner.lock().edges.remove_dependent(dependent);
    }

    fn notify_invalidated(&self) {
        debug!(channel = %self.channel, node = %self.id, "replica invalidated");
    }
}

impl<V: ReplicaValue> Drop for Replica<V> {
    fn drop(&mut self) {
        Graph::global().unregister(self.id);
    }
}

impl<V: ReplicaValue> fmt::Debug for Replica<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Replica")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("state", &inner.state)
            .field("version", &inner.version)
            .field("subscribed", &inner.subscribed)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Replicator
// ----------------------------------------------------------------------------

/// Type-erased face of a replica, used for dispatch.
trait ReplicaSink: Send + Sync {
    fn apply(&self, notification: Notification) -> ApplyOutcome;
    fn reconnected(&self);
}

/// Holds the replica strongly; the erased calls need an `Arc<Replica<V>>`.
struct Sink<V: ReplicaValue>(Arc<Replica<V>>);

impl<V: ReplicaValue> ReplicaSink for Sink<V> {
    fn apply(&self, notification: Notification) -> ApplyOutcome {
        self.0.apply(notification)
    }

    fn reconnected(&self) {
        self.0.mark_reconnected();
    }
}

struct Entry {
    sink: Arc<dyn ReplicaSink>,
    replica: Arc<dyn Any + Send + Sync>,
}

/// Client-side hub: one replica per channel, fed from a transport's frame
/// stream.
pub struct Replicator {
    transport: Arc<dyn ReplicaTransport>,
    replicas: DashMap<ChannelId, Entry>,
}

impl Replicator {
    pub fn new(transport: Arc<dyn ReplicaTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            replicas: DashMap::new(),
        })
    }

    /// The replica for `channel`, created on first use.
    ///
    /// Fails if the channel was already replicated with another value type.
    pub fn replica<V: ReplicaValue>(&self, channel: ChannelId) -> Result<Arc<Replica<V>>, ReplicaError> {
        let replica = self
            .replicas
            .entry(channel)
            .or_insert_with(|| {
                let replica = Replica::<V>::new(channel, Arc::clone(&self.transport));
                Entry {
                    sink: Arc::new(Sink(Arc::clone(&replica))),
                    replica,
                }
            })
            .replica
            .clone();

        replica
            .downcast::<Replica<V>>()
            .map_err(|_| ReplicaError::TypeMismatch(channel))
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Route a notification to its replica.
    pub fn dispatch(&self, notification: Notification) -> ApplyOutcome {
        let sink = match self.replicas.get(&notification.channel) {
            Some(entry) => Arc::clone(&entry.sink),
            None => {
                trace!(channel = %notification.channel, "notification for unknown replica");
                return ApplyOutcome::Unknown;
            }
        };
        sink.apply(notification)
    }

    /// Decode a transport frame and dispatch it.
    pub fn dispatch_frame(&self, frame: &[u8]) -> Result<ApplyOutcome, ReplicaError> {
        let notification = Notification::decode(frame).map_err(|e| {
            warn!(error = %e, len = frame.len(), "undecodable frame");
            e
        })?;
        Ok(self.dispatch(notification))
    }

    /// Pump frames until the stream ends.
    pub async fn run(&self, mut frames: mpsc::UnboundedReceiver<Vec<u8>>) {
        while let Some(frame) = frames.recv().await {
            let _ = self.dispatch_frame(&frame);
        }
        debug!("frame stream closed");
    }

    /// The transport reconnected: re-arm and re-subscribe every replica.
    pub fn reconnected(&self) {
        let sinks: Vec<Arc<dyn ReplicaSink>> = self
            .replicas
            .iter()
            .map(|entry| Arc::clone(&entry.sink))
            .collect();
        debug!(replicas = sinks.len(), "reconnected");
        for sink in sinks {
            sink.reconnected();
        }
    }

    /// Stop replicating `channel`.
    pub fn release(&self, channel: ChannelId) -> bool {
        match self.replicas.remove(&channel) {
            Some(_) => {
                self.transport.unsubscribe(channel);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Replicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replicator")
            .field("replicas", &self.len())
            .finish()
    }
}
