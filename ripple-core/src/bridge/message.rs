//! Wire Messages
//!
//! Everything that crosses the publisher/replica boundary is a
//! [`Notification`], encoded with MessagePack (`rmp-serde`, named fields).
//! Values travel as already-encoded bytes so the envelope does not need to
//! know the value type.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{ComputeError, TransportError};

/// Identifies a published computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Allocate a process-unique channel id.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for ChannelId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a notification carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    /// MessagePack encoding of the value.
    Value(#[serde(with = "serde_bytes")] Vec<u8>),
    /// The computation's cached error.
    Error(ComputeError),
    /// The channel is gone; the mirrored value is stale.
    Invalidated,
}

/// One update for one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: ChannelId,
    pub version: u64,
    pub body: Body,
}

impl Notification {
    pub fn value<V: Serialize>(
        channel: ChannelId,
        version: u64,
        value: &V,
    ) -> Result<Self, TransportError> {
        let bytes =
            rmp_serde::to_vec_named(value).map_err(|e| TransportError::Codec(e.to_string()))?;
        Ok(Self {
            channel,
            version,
            body: Body::Value(bytes),
        })
    }

    pub fn error(channel: ChannelId, version: u64, error: ComputeError) -> Self {
        Self {
            channel,
            version,
            body: Body::Error(error),
        }
    }

    pub fn invalidated(channel: ChannelId, version: u64) -> Self {
        Self {
            channel,
            version,
            body: Body::Invalidated,
        }
    }

    /// Decode the payload as a computation output.
    ///
    /// Returns `None` for an invalidation marker. A payload that does not
    /// decode as `V` becomes [`ComputeError::Decode`].
    pub fn output<V: DeserializeOwned>(&self) -> Option<Result<V, ComputeError>> {
        match &self.body {
            Body::Value(bytes) => Some(
                rmp_serde::from_slice(bytes).map_err(|e| ComputeError::Decode(e.to_string())),
            ),
            Body::Error(error) => Some(Err(error.clone())),
            Body::Invalidated => None,
        }
    }

    /// Encode into a transport frame.
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        rmp_serde::to_vec_named(self).map_err(|e| TransportError::Codec(e.to_string()))
    }

    /// Decode a transport frame.
    pub fn decode(frame: &[u8]) -> Result<Self, TransportError> {
        rmp_serde::from_slice(frame).map_err(|e| TransportError::Codec(e.to_string()))
    }
}
