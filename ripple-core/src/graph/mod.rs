//! Dependency Graph
//!
//! This module implements the dependency graph that connects memoized
//! computations, whatever their key and value types, and the client-side
//! replicas of remote computations.
//!
//! # Overview
//!
//! - Nodes are computations (or replicas) that produced a value.
//! - If A read B while computing, B holds a reverse edge to A, and A holds B
//!   in its dependency list.
//!
//! When a node is invalidated we follow reverse edges and mark everything
//! derived from it as invalidated. Recomputation is lazy: it happens on the
//! next read, not during the walk.
//!
//! # Design Decisions
//!
//! 1. Reverse edges are IDs, resolved through a central [`Graph`] registry.
//!    A node never owns its dependents, so there are no reference cycles.
//!
//! 2. Forward edges are strong. A computation keeps alive what it was
//!    derived from.
//!
//! 3. Edges live inside each node's own lock. There is no global graph lock.

mod node;
mod propagator;
mod registry;

pub use node::{
    Dependent, Edges, GraphNode, InvalidationObserver, Mark, NodeId, NodeState, ObserverId,
};
pub use propagator::InvalidationPropagator;
pub use registry::Graph;
