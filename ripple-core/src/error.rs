//! Error Types
//!
//! Errors are scoped to the key or channel they concern. None of them is
//! fatal to the process.
//!
//! [`ComputeError`] is special: it is a *value*. A failing computation stores
//! it as the node's output, and every current and future reader observes the
//! same error until the node is invalidated. It is therefore cloneable and
//! serializable, so it can also travel to replicas.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::ChannelId;

/// Result type produced by every memoized computation.
pub type ComputeResult<V> = Result<V, ComputeError>;

/// Failure of a computation, cached as the node's output.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ComputeError {
    /// The registered function reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The registered function panicked.
    #[error("computation panicked: {0}")]
    Panicked(String),

    /// A computation awaited its own result.
    #[error("dependency cycle through node {0}")]
    Cycle(u64),

    /// A remote value could not be fetched and no stale copy exists.
    #[error("remote value unavailable: {0}")]
    Unavailable(String),

    /// A remote value arrived but could not be decoded.
    #[error("failed to decode remote value: {0}")]
    Decode(String),
}

impl ComputeError {
    /// Build a [`ComputeError::Failed`] from anything displayable.
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

/// Errors raised by the [`Publisher`](crate::bridge::Publisher).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublisherError {
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("publisher must be created inside a tokio runtime")]
    NoRuntime,

    #[error("failed to encode value: {0}")]
    Encode(String),
}

/// Errors raised at the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("subscriber disconnected")]
    Disconnected,

    #[error("frame codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Publisher(#[from] PublisherError),
}

/// Errors raised by the [`Replicator`](crate::bridge::Replicator).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    #[error("channel {0} is already replicated with a different value type")]
    TypeMismatch(ChannelId),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
