//! Publish/Replicate Bridge
//!
//! Extends the dependency graph across a process boundary.
//!
//! # Server Side
//!
//! A [`Publisher`] exposes individual computation nodes as [`Channel`]s.
//! When a published node is invalidated, the channel waits out its
//! [`UpdateDelayer`] window and then pushes the node's new value to every
//! subscriber.
//!
//! # Client Side
//!
//! A [`Replicator`] keeps one [`Replica`] per channel. Replicas are graph
//! nodes themselves: a local computation that reads one is invalidated when
//! a newer remote value arrives.
//!
//! # Transport
//!
//! Frames are MessagePack-encoded [`Notification`]s. The bridge only needs
//! the [`Subscriber`] and [`ReplicaTransport`] traits; the crate ships an
//! in-process [`LoopbackTransport`].

mod delayer;
mod loopback;
mod message;
mod publisher;
mod replica;
mod transport;

pub use delayer::{DelayerState, PushFn, UpdateDelayer};
pub use loopback::LoopbackTransport;
pub use message::{Body, ChannelId, Notification};
pub use publisher::{Channel, Publisher};
pub use replica::{ApplyOutcome, Replica, ReplicaValue, Replicator};
pub use transport::{MemorySubscriber, ReplicaTransport, Subscriber, SubscriberId};
