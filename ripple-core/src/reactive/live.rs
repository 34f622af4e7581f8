//! Live State
//!
//! Keeps one computation permanently fresh: compute, publish, wait for
//! invalidation, wait out the delay, recompute. The latest output is
//! published on a `watch` channel, so readers always see the most recent
//! value and never a backlog.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::computed::{boxed, ComputationNode};
use super::key::CacheValue;
use crate::config::DelayPolicy;
use crate::error::ComputeResult;

/// A self-refreshing computation.
///
/// The refresh loop runs as a background task and stops when the
/// `LiveState` is dropped.
pub struct LiveState<V: CacheValue> {
    node: Arc<ComputationNode<&'static str, V>>,
    receiver: watch::Receiver<Option<ComputeResult<V>>>,
    task: JoinHandle<()>,
}

impl<V: CacheValue> LiveState<V> {
    /// Start refreshing `compute`, waiting `policy` between an invalidation
    /// and the recomputation it triggers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(name: &'static str, policy: DelayPolicy, compute: F) -> Self
    where
        F: Fn(&'static str) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ComputeResult<V>> + Send + 'static,
    {
        let node = ComputationNode::create(name, boxed(compute));
        node.start(1, None);

        let (sender, receiver) = watch::channel(None);
        let task = tokio::spawn(refresh(Arc::clone(&node), policy, sender));
        debug!(node = %node.id(), name, delay = ?policy.delay(), "live state started");

        Self {
            node,
            receiver,
            task,
        }
    }

    /// Most recent output, or `None` before the first computation finished.
    pub fn latest(&self) -> Option<ComputeResult<V>> {
        self.receiver.borrow().clone()
    }

    /// A receiver that is notified on every refresh.
    pub fn subscribe(&self) -> watch::Receiver<Option<ComputeResult<V>>> {
        self.receiver.clone()
    }

    pub fn node(&self) -> &Arc<ComputationNode<&'static str, V>> {
        &self.node
    }

    /// Invalidate the underlying computation, scheduling a refresh.
    pub fn invalidate(&self) -> usize {
        self.node.invalidate()
    }
}

impl<V: CacheValue> Drop for LiveState<V> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn refresh<V: CacheValue>(
    node: Arc<ComputationNode<&'static str, V>>,
    policy: DelayPolicy,
    sender: watch::Sender<Option<ComputeResult<V>>>,
) {
    loop {
        let (output, version) = node.get_untracked().await;
        trace!(node = %node.id(), version, "live state refreshed");
        sender.send_replace(Some(output));

        node.invalidated_since(version).await;
        policy.wait().await;
    }
}
