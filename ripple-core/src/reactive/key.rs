//! Computation keys and the capability traits a cache is generic over.

use std::fmt::{self, Debug};
use std::hash::Hash;

/// Anything usable as the identity of a memoized call.
pub trait CacheKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

/// Anything a memoized call can produce.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}

/// An operation identifier plus its ordered arguments.
///
/// ```rust,ignore
/// let key = ComputationKey::new("get_user", (42_u64,));
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ComputationKey<A> {
    pub operation: &'static str,
    pub args: A,
}

impl<A> ComputationKey<A> {
    pub fn new(operation: &'static str, args: A) -> Self {
        Self { operation, args }
    }
}

impl ComputationKey<()> {
    /// Key of an operation that takes no arguments.
    pub fn unit(operation: &'static str) -> Self {
        Self::new(operation, ())
    }
}

impl<A: Debug> Debug for ComputationKey<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.operation, self.args)
    }
}
