//! Invalidation Propagator
//!
//! Walks reverse edges from an invalidated node and marks everything that
//! was derived from it.
//!
//! # Algorithm
//!
//! 1. Ask the seed to invalidate itself.
//! 2. If it transitioned, it hands back the dependents it had recorded
//!    (and forgets them: those edges belonged to the value that just went
//!    stale).
//! 3. Resolve each dependent through the registry and repeat, breadth-first.
//!
//! Nothing is recomputed here. A node that is already `Invalidated` stops the
//! walk, and the visited set keeps diamond-shaped graphs from being walked
//! twice. Each node is only ever locked on its own, so walks over disjoint
//! parts of the graph never contend.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace};

use super::node::{Dependent, GraphNode, Mark, NodeId};
use super::registry::Graph;

type Queue = VecDeque<(Arc<dyn GraphNode>, Option<u64>)>;

/// Breadth-first invalidation over a [`Graph`].
pub struct InvalidationPropagator<'g> {
    graph: &'g Graph,
}

impl<'g> InvalidationPropagator<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self { graph }
    }

    /// Propagator over the process-wide registry.
    pub fn global() -> InvalidationPropagator<'static> {
        InvalidationPropagator::new(Graph::global())
    }

    /// Invalidate `seed` and everything reachable through its dependents.
    ///
    /// Returns the number of nodes that transitioned to `Invalidated`.
    pub fn propagate(&self, seed: Arc<dyn GraphNode>) -> usize {
        self.propagate_from(seed, None)
    }

    /// Like [`propagate`](Self::propagate), but only if `seed` is still at
    /// `generation`.
    pub fn propagate_from(&self, seed: Arc<dyn GraphNode>, generation: Option<u64>) -> usize {
        let seed_id = seed.id();
        let mut queue = VecDeque::new();
        queue.push_back((seed, generation));

        let invalidated = self.walk(queue);
        if invalidated > 0 {
            debug!(seed = %seed_id, invalidated, "invalidation propagated");
        }
        invalidated
    }

    /// Invalidate the given dependents (and what depends on them) on behalf
    /// of a node that already marked itself.
    pub fn propagate_to(&self, dependents: Vec<Dependent>) -> usize {
        let mut queue = VecDeque::new();
        self.enqueue(&mut queue, dependents);
        self.walk(queue)
    }

    fn enqueue(&self, queue: &mut Queue, dependents: Vec<Dependent>) {
        for dependent in dependents {
            match self.graph.resolve(dependent.id) {
                Some(next) => queue.push_back((next, Some(dependent.generation))),
                None => trace!(node = %dependent.id, "dependent already dropped"),
            }
        }
    }

    fn walk(&self, mut queue: Queue) -> usize {
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut invalidated = 0;

        while let Some((node, generation)) = queue.pop_front() {
            let node_id = node.id();
            if visited.contains(&node_id) {
                continue;
            }

            match node.mark_invalidated(generation) {
                Mark::Invalidated(dependents) => {
                    visited.insert(node_id);
                    invalidated += 1;
                    node.notify_invalidated();
                    self.enqueue(&mut queue, dependents);
                }
                Mark::Deferred => {
                    visited.insert(node_id);
                    trace!(node = %node_id, "invalidation deferred until computation completes");
                }
                // Stale edges are not recorded as visited: the same node may
                // still be reachable through a current one.
                Mark::Unchanged => {}
            }
        }

        invalidated
    }
}
