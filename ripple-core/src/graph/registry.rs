//! Node Registry
//!
//! Reverse edges are stored as plain [`NodeId`]s. The registry is where those
//! ids are turned back into nodes during invalidation.
//!
//! Entries are weak: the registry never keeps a node alive. A node registers
//! itself on creation and unregisters when dropped.

use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;

use super::node::{GraphNode, NodeId};

/// Table of live graph nodes, indexed by ID.
pub struct Graph {
    nodes: DashMap<NodeId, Weak<dyn GraphNode>>,
}

static GLOBAL: OnceLock<Graph> = OnceLock::new();

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
        }
    }

    /// The process-wide registry shared by all caches and replicas.
    pub fn global() -> &'static Graph {
        GLOBAL.get_or_init(Graph::new)
    }

    pub fn register(&self, id: NodeId, node: Weak<dyn GraphNode>) {
        self.nodes.insert(id, node);
    }

    pub fn unregister(&self, id: NodeId) {
        self.nodes.remove(&id);
    }

    /// Resolve an ID to a live node.
    pub fn resolve(&self, id: NodeId) -> Option<Arc<dyn GraphNode>> {
        self.nodes.get(&id).and_then(|entry| entry.value().upgrade())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Get the total number of registered nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}
