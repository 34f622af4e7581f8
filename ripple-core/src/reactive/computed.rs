//! Computation Nodes
//!
//! A [`ComputationNode`] is the memoized record of one call: its key, its
//! last output, a version, a lifecycle state, and its edges in the
//! dependency graph.
//!
//! # How Nodes Work
//!
//! 1. A node is created `Computing` and its computation is spawned at once.
//!
//! 2. Every reader arriving while it is `Computing` waits for that single
//!    computation instead of starting another one.
//!
//! 3. On completion the output (value *or* error) is stored, the version is
//!    bumped and the node becomes `Consistent`.
//!
//! 4. Invalidation flips it to `Invalidated` and walks its dependents. The
//!    stale output is kept; nothing is recomputed yet.
//!
//! 5. The next read starts exactly one recomputation, which rebuilds the
//!    dependency list from scratch.
//!
//! # Races
//!
//! Invalidating a node that is `Computing` is remembered and applied the
//! moment the in-flight output is stored: the node then goes straight to
//! `Invalidated`. The same happens if the computation read a dependency that
//! was already stale. Waiters on that computation still receive its output.
//!
//! Computations run as spawned tasks. A reader that stops waiting does not
//! cancel the computation others may be waiting for.

use std::collections::HashSet;
use std::fmt::{self, Debug};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::context::{ComputeContext, Frame};
use super::key::{CacheKey, CacheValue};
use crate::error::{ComputeError, ComputeResult};
use crate::graph::{
    Dependent, Edges, Graph, GraphNode, InvalidationObserver, InvalidationPropagator, Mark,
    NodeId, NodeState, ObserverId,
};

/// The function a node runs to (re)compute its value.
pub type ComputeFn<K, V> = Arc<dyn Fn(K) -> BoxFuture<'static, ComputeResult<V>> + Send + Sync>;

/// Snapshot broadcast to everyone waiting on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Status {
    state: NodeState,
    /// Generation of the last stored output.
    completed: u64,
    version: u64,
}

struct Inner<V> {
    state: NodeState,
    output: Option<ComputeResult<V>>,
    version: u64,
    /// Generation of the last started computation.
    generation: u64,
    /// Generation of the last stored output.
    completed: u64,
    /// Invalidation arrived while computing.
    invalidate_pending: bool,
    /// Evicted: outputs are no longer wired into the graph.
    detached: bool,
    edges: Edges,
}

enum Step<V> {
    Ready(ComputeResult<V>, u64),
    Wait(u64),
    Start(u64),
}

/// The memoized record of one call.
pub struct ComputationNode<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    id: NodeId,
    key: K,
    compute: ComputeFn<K, V>,
    inner: Mutex<Inner<V>>,
    status: watch::Sender<Status>,
    observers: Mutex<SmallVec<[(ObserverId, Weak<dyn InvalidationObserver>); 2]>>,
}

impl<K, V> ComputationNode<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    /// Create a node outside any cache and start computing it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<F, Fut>(key: K, compute: F) -> Arc<Self>
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ComputeResult<V>> + Send + 'static,
    {
        let node = Self::create(key, boxed(compute));
        node.start(1, ComputeContext::current_frame());
        node
    }

    /// Create a registered node in the `Computing` state without starting
    /// it. The caller must follow up with [`start`](Self::start) for
    /// generation 1.
    pub(crate) fn create(key: K, compute: ComputeFn<K, V>) -> Arc<Self> {
        let status = Status {
            state: NodeState::Computing,
            completed: 0,
            version: 0,
        };
        let node = Arc::new(Self {
            id: NodeId::new(),
            key,
            compute,
            inner: Mutex::new(Inner {
                state: NodeState::Computing,
                output: None,
                version: 0,
                generation: 1,
                completed: 0,
                invalidate_pending: false,
                detached: false,
                edges: Edges::new(),
            }),
            status: watch::Sender::new(status),
            observers: Mutex::new(SmallVec::new()),
        });
        let weak: Weak<dyn GraphNode> = Arc::downgrade(&node) as Weak<dyn GraphNode>;
        Graph::global().register(node.id, weak);
        node
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn state(&self) -> NodeState {
        self.inner.lock().state
    }

    /// Number of outputs stored so far.
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Last stored output, without computing or recording a dependency.
    pub fn peek(&self) -> Option<ComputeResult<V>> {
        self.inner.lock().output.clone()
    }

    pub fn dependency_count(&self) -> usize {
        self.inner.lock().edges.dependency_count()
    }

    pub fn dependent_count(&self) -> usize {
        self.inner.lock().edges.dependent_count()
    }

    /// Get the current value, recomputing or waiting as needed.
    ///
    /// Called from inside another computation, this also records that
    /// computation as a dependent of this node.
    pub async fn get_or_await_value(self: &Arc<Self>) -> ComputeResult<V> {
        self.resolve(ComputeContext::current_frame()).await.0
    }

    /// Like [`get_or_await_value`](Self::get_or_await_value), but never
    /// records a dependency and also returns the output's version.
    pub async fn get_untracked(self: &Arc<Self>) -> (ComputeResult<V>, u64) {
        self.resolve(None).await
    }

    /// Invalidate this node and everything derived from it.
    ///
    /// Returns the number of nodes that became `Invalidated`.
    pub fn invalidate(self: &Arc<Self>) -> usize {
        InvalidationPropagator::global().propagate(self.clone())
    }

    /// Resolves once the output currently held is no longer current.
    pub async fn when_invalidated(&self) {
        let version = self.version();
        self.invalidated_since(version).await;
    }

    /// Resolves once the output with `version` is no longer current.
    pub(crate) async fn invalidated_since(&self, version: u64) {
        let mut status = self.status.subscribe();
        let _ = status
            .wait_for(|s| s.version > version || s.state != NodeState::Consistent)
            .await;
    }

    /// Invalidate, then cut every forward edge. Used on eviction.
    ///
    /// A computation still in flight is detached too: its output reaches
    /// its waiters but installs no edges, and the node stays `Invalidated`.
    pub(crate) fn detach(self: &Arc<Self>) {
        self.inner.lock().detached = true;
        self.invalidate();
        let (dependencies, generation) = {
            let mut inner = self.inner.lock();
            (inner.edges.take_dependencies(), inner.generation)
        };
        let link = Dependent { id: self.id, generation };
        for dependency in dependencies {
            dependency.remove_dependent(link);
        }
    }

    pub(crate) fn observe(&self, observer: Weak<dyn InvalidationObserver>) -> ObserverId {
        let id = ObserverId::new();
        self.observers.lock().push((id, observer));
        id
    }

    pub(crate) fn unobserve(&self, id: ObserverId) {
        self.observers.lock().retain(|(observer, _)| *observer != id);
    }

    async fn resolve(self: &Arc<Self>, frame: Option<Arc<Frame>>) -> (ComputeResult<V>, u64) {
        let mut awaited: Option<u64> = None;

        loop {
            let step = {
                let mut inner = self.inner.lock();
                let served = inner.state == NodeState::Consistent
                    || awaited.is_some_and(|g| inner.completed >= g);

                match (served, inner.output.clone()) {
                    (true, Some(output)) => {
                        if let Some(frame) = &frame {
                            inner.edges.add_dependent(frame.as_dependent());
                            if inner.state != NodeState::Consistent {
                                frame.mark_stale();
                            }
                        }
                        Step::Ready(output, inner.version)
                    }
                    _ => match inner.state {
                        NodeState::Computing => {
                            if frame.as_ref().is_some_and(|f| f.contains(self.id)) {
                                return (Err(ComputeError::Cycle(self.id.raw())), inner.version);
                            }
                            Step::Wait(inner.generation)
                        }
                        NodeState::Invalidated | NodeState::Consistent => {
                            inner.generation += 1;
                            inner.state = NodeState::Computing;
                            inner.invalidate_pending = false;
                            self.publish(&inner);
                            Step::Start(inner.generation)
                        }
                    },
                }
            };

            match step {
                Step::Ready(output, version) => {
                    if let Some(frame) = &frame {
                        let node: Arc<dyn GraphNode> = self.clone();
                        frame.record(node);
                    }
                    return (output, version);
                }
                Step::Wait(generation) => {
                    trace!(node = %self.id, generation, "waiting on in-flight computation");
                    awaited = Some(generation);
                    let mut status = self.status.subscribe();
                    let _ = status.wait_for(|s| s.completed >= generation).await;
                }
                Step::Start(generation) => {
                    awaited = Some(generation);
                    self.start(generation, frame.clone());
                }
            }
        }
    }

    /// Spawn the computation for `generation`.
    pub(crate) fn start(self: &Arc<Self>, generation: u64, parent: Option<Arc<Frame>>) {
        let weak: Weak<dyn GraphNode> = Arc::downgrade(self) as Weak<dyn GraphNode>;
        let frame = Frame::new(weak, self.id, generation, parent);
        let compute = Arc::clone(&self.compute);
        let key = self.key.clone();
        let node = Arc::clone(self);

        debug!(node = %self.id, key = ?self.key, generation, "computation started");

        tokio::spawn(async move {
            let run = AssertUnwindSafe(async move { compute(key).await }).catch_unwind();
            let output = ComputeContext::scope(frame.clone(), run)
                .await
                .unwrap_or_else(|panic| Err(ComputeError::from_panic(panic)));
            node.complete(generation, output, &frame);
        });
    }

    fn complete(&self, generation: u64, output: ComputeResult<V>, frame: &Frame) {
        let dependencies = frame.take_dependencies();
        let current: HashSet<NodeId> = dependencies.iter().map(|d| d.id()).collect();
        let failed = output.is_err();

        let (invalidated, dependents, unlinked, version) = {
            let mut inner = self.inner.lock();
            debug_assert_eq!(inner.generation, generation);

            inner.output = Some(output);
            inner.version += 1;
            inner.completed = generation;

            let invalidated = std::mem::take(&mut inner.invalidate_pending)
                || frame.is_stale()
                || inner.detached;
            let dependents = if invalidated {
                inner.state = NodeState::Invalidated;
                inner.edges.take_dependents()
            } else {
                inner.state = NodeState::Consistent;
                Vec::new()
            };
            let unlinked: SmallVec<[Arc<dyn GraphNode>; 4]> = if inner.detached {
                dependencies
            } else {
                inner
                    .edges
                    .replace_dependencies(dependencies)
                    .into_iter()
                    .filter(|d| !current.contains(&d.id()))
                    .collect()
            };
            self.publish(&inner);
            (invalidated, dependents, unlinked, inner.version)
        };

        // Edges recorded by a later generation survive this.
        let link = Dependent { id: self.id, generation };
        for dependency in unlinked {
            dependency.remove_dependent(link);
        }

        debug!(
            node = %self.id,
            generation,
            version,
            failed,
            dependencies = current.len(),
            invalidated,
            "computation finished"
        );

        if invalidated {
            self.notify_invalidated();
            InvalidationPropagator::global().propagate_to(dependents);
        }
    }

    fn publish(&self, inner: &Inner<V>) {
        self.status.send_replace(Status {
            state: inner.state,
            completed: inner.completed,
            version: inner.version,
        });
    }
}

impl<K, V> GraphNode for ComputationNode<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
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
            NodeState::Invalidated => Mark::Unchanged,
            NodeState::Computing if inner.invalidate_pending => Mark::Unchanged,
            NodeState::Computing => {
                inner.invalidate_pending = true;
                Mark::Deferred
            }
            NodeState::Consistent => {
                inner.state = NodeState::Invalidated;
                let dependents = inner.edges.take_dependents();
                self.publish(&inner);
                Mark::Invalidated(dependents)
            }
        }
    }

    fn add_dependent(&self, dependent: Dependent) {
        self.inner.lock().edges.add_dependent(dependent);
    }

    fn remove_dependent(&self, dependent: Dependent) {
        self.inner.lock().edges.remove_dependent(dependent);
    }

    fn notify_invalidated(&self) {
        debug!(node = %self.id, key = ?self.key, "invalidated");

        let observers: SmallVec<[Arc<dyn InvalidationObserver>; 2]> = {
            let mut observers = self.observers.lock();
            observers.retain(|(_, observer)| observer.strong_count() > 0);
            observers
                .iter()
                .filter_map(|(_, observer)| observer.upgrade())
                .collect()
        };
        for observer in observers {
            observer.on_invalidated(self.id);
        }
    }
}

impl<K, V> Drop for ComputationNode<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn drop(&mut self) {
        Graph::global().unregister(self.id);
    }
}

impl<K, V> Debug for ComputationNode<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ComputationNode")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &inner.state)
            .field("version", &inner.version)
            .field("edges", &inner.edges)
            .finish()
    }
}

pub(crate) fn boxed<K, V, F, Fut>(compute: F) -> ComputeFn<K, V>
where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ComputeResult<V>> + Send + 'static,
{
    Arc::new(move |key: K| -> BoxFuture<'static, ComputeResult<V>> { Box::pin(compute(key)) })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
