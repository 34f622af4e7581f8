//! Graph Nodes
//!
//! This module defines what every participant in the dependency graph has in
//! common, independent of its key and value types: an identity, a lifecycle
//! state, and the edge bookkeeping needed for invalidation.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// A computation for this node is in flight.
    Computing,

    /// The stored output (value or error) is current.
    Consistent,

    /// Something the output was derived from changed. The stale output is
    /// kept until the next read recomputes it.
    Invalidated,
}

/// A reverse edge: `id` read this node while computing its generation
/// `generation`.
///
/// The generation tag lets propagation ignore edges left behind by an older
/// computation of the dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dependent {
    pub id: NodeId,
    pub generation: u64,
}

/// Outcome of asking a node to become invalidated.
#[derive(Debug)]
pub enum Mark {
    /// The node transitioned to `Invalidated`. Carries the dependents that
    /// must be visited next.
    Invalidated(Vec<Dependent>),

    /// The node is computing; it will become `Invalidated` as soon as the
    /// in-flight result is stored.
    Deferred,

    /// Nothing to do: already invalidated, or the edge was stale.
    Unchanged,
}

/// Identifier handed out when an observer is attached to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ObserverId {
    fn default() -> Self {
        Self::new()
    }
}

/// Something that wants to hear about a node turning `Invalidated`.
///
/// Publisher channels implement this to feed their update delayer.
pub trait InvalidationObserver: Send + Sync {
    fn on_invalidated(self: Arc<Self>, node: NodeId);
}

/// Type-erased view of a graph participant.
///
/// Computation nodes of every key/value type and client-side replicas all
/// implement this, which is what lets a computation depend on anything.
pub trait GraphNode: Send + Sync + 'static {
    fn id(&self) -> NodeId;

    fn state(&self) -> NodeState;

    /// Try to invalidate this node.
    ///
    /// `generation` is `Some` when arriving through a dependent edge; the
    /// node ignores the request if it has moved on to another generation.
    fn mark_invalidated(&self, generation: Option<u64>) -> Mark;

    /// Record that `dependent` read this node.
    fn add_dependent(&self, dependent: Dependent);

    /// Drop the reverse edge from `dependent.id`, unless it was recorded by
    /// a later generation than `dependent.generation`.
    fn remove_dependent(&self, dependent: Dependent);

    /// Tell attached observers the node was invalidated.
    fn notify_invalidated(&self);
}

/// Edge bookkeeping shared by every node implementation.
///
/// Always lives inside the owning node's lock, so edge updates are atomic
/// with state transitions of that node.
#[derive(Default)]
pub struct Edges {
    /// Nodes read while computing the current value (strong: a computation
    /// keeps what it was derived from alive).
    dependencies: SmallVec<[Arc<dyn GraphNode>; 4]>,

    /// Nodes that read this node, resolved through the registry.
    dependents: HashMap<NodeId, u64>,
}

impl Edges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dependent(&mut self, dependent: Dependent) {
        self.dependents.insert(dependent.id, dependent.generation);
    }

    /// Remove the edge from `dependent.id` if its recorded generation is not
    /// newer than `dependent.generation`. Returns whether an edge was removed.
    pub fn remove_dependent(&mut self, dependent: Dependent) -> bool {
        match self.dependents.get(&dependent.id) {
            Some(&recorded) if recorded <= dependent.generation => {
                self.dependents.remove(&dependent.id);
                true
            }
            _ => false,
        }
    }

    /// Remove and return every reverse edge.
    pub fn take_dependents(&mut self) -> Vec<Dependent> {
        self.dependents
            .drain()
            .map(|(id, generation)| Dependent { id, generation })
            .collect()
    }

    pub fn dependent_count(&self) -> usize {
        self.dependents.len()
    }

    pub fn has_dependent(&self, id: NodeId) -> bool {
        self.dependents.contains_key(&id)
    }

    pub fn dependency_count(&self) -> usize {
        self.dependencies.len()
    }

    /// Install a new dependency list, returning the previous one.
    pub fn replace_dependencies(
        &mut self,
        dependencies: SmallVec<[Arc<dyn GraphNode>; 4]>,
    ) -> SmallVec<[Arc<dyn GraphNode>; 4]> {
        std::mem::replace(&mut self.dependencies, dependencies)
    }

    pub fn take_dependencies(&mut self) -> SmallVec<[Arc<dyn GraphNode>; 4]> {
        std::mem::take(&mut self.dependencies)
    }
}

impl fmt::Debug for Edges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edges")
            .field(
                "dependencies",
                &self.dependencies.iter().map(|d| d.id()).collect::<Vec<_>>(),
            )
            .field("dependents", &self.dependents)
            .finish()
    }
}
