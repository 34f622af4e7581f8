//! Computation Cache
//!
//! This module implements memoized computations and the cache that owns
//! them.
//!
//! # Concepts
//!
//! ## Computation Nodes
//!
//! A node is the memoized result of one call, identified by its key. It
//! holds the last output (a value or an error), a version that grows with
//! every stored output, and a lifecycle state.
//!
//! ## Dependency Tracking
//!
//! Reading a node from inside another computation makes that computation a
//! dependent of the node read. No explicit declaration is needed: the
//! running computation is found through an ambient, task-local frame.
//!
//! ## Invalidation
//!
//! Invalidating a node marks it and everything derived from it as stale.
//! Nothing is recomputed until somebody reads the value again.
//!
//! ## Live State
//!
//! A [`LiveState`] keeps one computation fresh in the background, refreshing
//! it after each invalidation once a configurable delay has passed.

mod cache;
mod computed;
mod context;
mod key;
mod live;

pub use cache::ComputationCache;
pub use computed::{ComputationNode, ComputeFn};
pub use context::{ComputationHandle, ComputeContext};
pub use key::{CacheKey, CacheValue, ComputationKey};
pub use live::LiveState;
