//! Compute Context
//!
//! The compute context tracks which computation is currently running, so
//! that reading a cached node from inside a computation records a dependency
//! edge without the caller passing anything around.
//!
//! # Implementation
//!
//! Each computation runs inside a task-local *frame*. The frame follows the
//! logical call chain across `.await` points and worker threads, and is
//! restored when the computation's future completes. Unrelated computations
//! running concurrently each see only their own frame.
//!
//! Frames link to the frame that started them. That chain is what lets a
//! computation that waits on itself fail with a cycle error instead of
//! deadlocking.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::trace;

use crate::graph::{Dependent, GraphNode, InvalidationPropagator, NodeId};

tokio::task_local! {
    static CURRENT_FRAME: Arc<Frame>;
}

/// Bookkeeping for one running computation.
pub(crate) struct Frame {
    node: Weak<dyn GraphNode>,
    node_id: NodeId,
    generation: u64,
    parent: Option<Arc<Frame>>,
    dependencies: Mutex<SmallVec<[Arc<dyn GraphNode>; 4]>>,
    stale: AtomicBool,
}

impl Frame {
    pub(crate) fn new(
        node: Weak<dyn GraphNode>,
        node_id: NodeId,
        generation: u64,
        parent: Option<Arc<Frame>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node,
            node_id,
            generation,
            parent,
            dependencies: Mutex::new(SmallVec::new()),
            stale: AtomicBool::new(false),
        })
    }

    /// The reverse edge a read from this frame leaves on the node read.
    pub(crate) fn as_dependent(&self) -> Dependent {
        Dependent {
            id: self.node_id,
            generation: self.generation,
        }
    }

    /// Remember that this computation read `dependency`.
    pub(crate) fn record(&self, dependency: Arc<dyn GraphNode>) {
        let mut dependencies = self.dependencies.lock();
        if dependencies.iter().all(|d| d.id() != dependency.id()) {
            trace!(node = %self.node_id, dependency = %dependency.id(), "dependency recorded");
            dependencies.push(dependency);
        }
    }

    /// The computation read a value that was already invalidated.
    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    pub(crate) fn take_dependencies(&self) -> SmallVec<[Arc<dyn GraphNode>; 4]> {
        std::mem::take(&mut *self.dependencies.lock())
    }

    /// Whether `id` is computing somewhere up this frame's chain.
    pub(crate) fn contains(&self, id: NodeId) -> bool {
        let mut frame = Some(self);
        while let Some(current) = frame {
            if current.node_id == id {
                return true;
            }
            frame = current.parent.as_deref();
        }
        false
    }
}

/// Entry points into the ambient compute context.
pub struct ComputeContext;

impl ComputeContext {
    /// Run `future` with `frame` as the current computation.
    pub(crate) async fn scope<F>(frame: Arc<Frame>, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_FRAME.scope(frame, future).await
    }

    pub(crate) fn current_frame() -> Option<Arc<Frame>> {
        CURRENT_FRAME.try_with(Arc::clone).ok()
    }

    /// Check if a computation is running on this task.
    pub fn is_active() -> bool {
        CURRENT_FRAME.try_with(|_| ()).is_ok()
    }

    /// Handle to the computation running on this task, if any.
    ///
    /// The handle stays valid after the computation finishes and can be used
    /// to invalidate exactly the version it produced, e.g. from a timer.
    pub fn current() -> Option<ComputationHandle> {
        CURRENT_FRAME
            .try_with(|frame| ComputationHandle {
                node: frame.node.clone(),
                id: frame.node_id,
                generation: frame.generation,
            })
            .ok()
    }
}

/// Reference to one computation of one node.
#[derive(Clone)]
pub struct ComputationHandle {
    node: Weak<dyn GraphNode>,
    id: NodeId,
    generation: u64,
}

impl ComputationHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Invalidate the value this computation produced.
    ///
    /// No-op if the node has since recomputed or been dropped.
    pub fn invalidate(&self) -> usize {
        match self.node.upgrade() {
            Some(node) => InvalidationPropagator::global().propagate_from(node, Some(self.generation)),
            None => 0,
        }
    }
}

impl std::fmt::Debug for ComputationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputationHandle")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Mark, NodeState};

    struct Leaf(NodeId);

    impl GraphNode for Leaf {
        fn id(&self) -> NodeId {
            self.0
        }
        fn state(&self) -> NodeState {
            NodeState::Consistent
        }
        fn mark_invalidated(&self, _generation: Option<u64>) -> Mark {
            Mark::Unchanged
        }
        fn add_dependent(&self, _dependent: Dependent) {}
        fn remove_dependent(&self, _dependent: Dependent) {}
        fn notify_invalidated(&self) {}
    }

    fn frame(parent: Option<Arc<Frame>>) -> Arc<Frame> {
        let node: Weak<dyn GraphNode> = Weak::<Leaf>::new();
        Frame::new(node, NodeId::new(), 1, parent)
    }

    #[tokio::test]
    async fn context_tracks_frame() {
        assert!(!ComputeContext::is_active());
        assert!(ComputeContext::current().is_none());

        let outer = frame(None);
        let outer_id = outer.node_id;
        ComputeContext::scope(outer, async move {
            assert!(ComputeContext::is_active());
            assert_eq!(ComputeContext::current().map(|h| h.id()), Some(outer_id));
        })
        .await;

        // Context should be cleaned up after the scope ends
        assert!(!ComputeContext::is_active());
    }

    #[tokio::test]
    async fn nested_frames_restore_outer() {
        let outer = frame(None);
        let outer_id = outer.node_id;
        let inner = frame(Some(outer.clone()));
        let inner_id = inner.node_id;

        ComputeContext::scope(outer, async move {
            ComputeContext::scope(inner, async move {
                assert_eq!(ComputeContext::current().map(|h| h.id()), Some(inner_id));
            })
            .await;

            // After the inner scope ends, outer should be current
            assert_eq!(ComputeContext::current().map(|h| h.id()), Some(outer_id));
        })
        .await;
    }

    #[tokio::test]
    async fn concurrent_tasks_see_their_own_frames() {
        let a = frame(None);
        let b = frame(None);
        let (a_id, b_id) = (a.node_id, b.node_id);

        let task_a = tokio::spawn(ComputeContext::scope(a, async move {
            tokio::task::yield_now().await;
            ComputeContext::current().map(|h| h.id())
        }));
        let task_b = tokio::spawn(ComputeContext::scope(b, async move {
            tokio::task::yield_now().await;
            ComputeContext::current().map(|h| h.id())
        }));

        assert_eq!(task_a.await.unwrap(), Some(a_id));
        assert_eq!(task_b.await.unwrap(), Some(b_id));
    }

    #[test]
    fn records_each_dependency_once() {
        let frame = frame(None);
        let leaf: Arc<dyn GraphNode> = Arc::new(Leaf(NodeId::new()));

        frame.record(leaf.clone());
        frame.record(leaf.clone());

        assert_eq!(frame.take_dependencies().len(), 1);
        assert!(frame.take_dependencies().is_empty());
    }

    #[test]
    fn frame_chain_lookup() {
        let outer = frame(None);
        let inner = frame(Some(outer.clone()));

        assert!(inner.contains(outer.node_id));
        assert!(inner.contains(inner.node_id));
        assert!(!outer.contains(inner.node_id));
    }

    #[test]
    fn handle_to_dropped_node_is_inert() {
        let handle = ComputationHandle {
            node: Weak::<Leaf>::new(),
            id: NodeId::new(),
            generation: 1,
        };
        assert_eq!(handle.invalidate(), 0);
    }
}
