//! Ripple Core
//!
//! This crate provides a reactive computation cache. It implements:
//!
//! - Memoized computations keyed by call signature
//! - Automatic dependency tracking between computations
//! - Transitive, lazy invalidation
//! - A publish/replicate bridge that carries values and invalidations
//!   across a process boundary
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Type-erased dependency graph and invalidation propagation
//! - `reactive`: Computation nodes, the cache and live state
//! - `bridge`: Publisher, replicas, update delays and transports
//! - `config`: Per-category push delays
//! - `error`: Error types
//!
//! # Example
//!
//! ```rust,ignore
//! use ripple_core::reactive::ComputationCache;
//!
//! let cache: ComputationCache<&str, i64> = ComputationCache::new();
//!
//! // Memoized: computed once, then served from the cache
//! let count = cache.get_or_compute("count", |_| async { Ok(load_count().await) }).await?;
//!
//! // `total` reads `count`, so it becomes a dependent of it
//! let reader = cache.clone();
//! let total = cache
//!     .get_or_compute("total", move |_| {
//!         let cache = reader.clone();
//!         async move { Ok(cache.get_or_compute("count", load).await? + 1) }
//!     })
//!     .await?;
//!
//! // A write marks both stale; they recompute on the next read
//! cache.invalidate(&"count");
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;

pub use bridge::{LoopbackTransport, Publisher, Replica, Replicator, UpdateDelayer};
pub use config::{DelayConfig, DelayPolicy};
pub use error::{ComputeError, ComputeResult, PublisherError, ReplicaError, TransportError};
pub use reactive::{ComputationCache, ComputationKey, ComputationNode, ComputeContext, LiveState};
