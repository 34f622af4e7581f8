//! Computation Cache
//!
//! Keyed store of [`ComputationNode`]s. This is the entry point application
//! code uses: memoized reads go through [`get_or_compute`], writes report
//! what they touched through [`invalidate`].
//!
//! The node table is sharded, so callers working on different keys rarely
//! contend, and no lock on the table is ever held across an `.await`.
//!
//! [`get_or_compute`]: ComputationCache::get_or_compute
//! [`invalidate`]: ComputationCache::invalidate

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::computed::{boxed, ComputationNode};
use super::context::ComputeContext;
use super::key::{CacheKey, CacheValue};
use crate::error::ComputeResult;

/// Memoizes computations by key.
///
/// Cloning is cheap and shares the same table.
pub struct ComputationCache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    nodes: Arc<DashMap<K, Arc<ComputationNode<K, V>>>>,
}

impl<K, V> ComputationCache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(DashMap::new()),
        }
    }

    /// Return the value for `key`, computing it with `compute` if needed.
    ///
    /// Concurrent callers for the same key share one computation. The
    /// function given by the caller that created the node is the one used
    /// for every later recomputation of that key.
    pub async fn get_or_compute<F, Fut>(&self, key: K, compute: F) -> ComputeResult<V>
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ComputeResult<V>> + Send + 'static,
    {
        let node = self.node(key, compute);
        node.get_or_await_value().await
    }

    /// Return the node for `key`, creating it (and starting its first
    /// computation) if absent.
    pub fn node<F, Fut>(&self, key: K, compute: F) -> Arc<ComputationNode<K, V>>
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ComputeResult<V>> + Send + 'static,
    {
        if let Some(node) = self.nodes.get(&key) {
            return Arc::clone(node.value());
        }

        let mut created = false;
        let node = self
            .nodes
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                ComputationNode::create(key, boxed(compute))
            })
            .value()
            .clone();

        if created {
            node.start(1, ComputeContext::current_frame());
        }
        node
    }

    /// Look up an existing node without computing anything.
    pub fn get(&self, key: &K) -> Option<Arc<ComputationNode<K, V>>> {
        self.nodes.get(key).map(|node| Arc::clone(node.value()))
    }

    /// Invalidate the node for `key` and everything derived from it.
    ///
    /// A key that was never cached has nothing stale to mark; this returns
    /// 0 and does nothing.
    pub fn invalidate(&self, key: &K) -> usize {
        match self.get(key) {
            Some(node) => node.invalidate(),
            None => {
                debug!(key = ?key, "invalidate: key not cached");
                0
            }
        }
    }

    /// Drop the node for `key` from the cache.
    ///
    /// Dependents are invalidated first, then the node is detached from the
    /// graph. Returns whether a node was present.
    pub fn evict(&self, key: &K) -> bool {
        match self.nodes.remove(key) {
            Some((_, node)) => {
                node.detach();
                debug!(node = %node.id(), key = ?key, "evicted");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl<K, V> Clone for ComputationCache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn clone(&self) -> Self {
        Self {
            nodes: Arc::clone(&self.nodes),
        }
    }
}

impl<K, V> Default for ComputationCache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> std::fmt::Debug for ComputationCache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationCache")
            .field("len", &self.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
