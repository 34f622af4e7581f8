//! Delay Configuration
//!
//! Push cadence is configured per category at startup. A category is just a
//! name chosen by the application ("screen", "time", ...); the core treats
//! the resulting delay as an opaque "wait this long before the next push".
//!
//! ```json
//! { "default_delay_ms": 100, "categories": { "screen": 0, "time": 500 } }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay used when no category matches.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(100);

/// Minimum delay between a channel becoming eligible to push and the push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DelayPolicy {
    delay: Duration,
}

impl DelayPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// A policy that pushes on the next scheduling turn.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_immediate(&self) -> bool {
        self.delay.is_zero()
    }

    /// Sleep for the configured delay. A zero delay still yields once.
    pub async fn wait(&self) {
        if self.delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.delay).await;
        }
    }
}

/// Startup configuration of per-category delays, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayConfig {
    /// Delay applied to uncategorized channels.
    pub default_delay_ms: u64,

    /// Named overrides.
    pub categories: HashMap<String, u64>,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            default_delay_ms: DEFAULT_DELAY.as_millis() as u64,
            categories: HashMap::new(),
        }
    }
}

impl DelayConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_default(mut self, delay: Duration) -> Self {
        self.default_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_category(mut self, name: impl Into<String>, delay: Duration) -> Self {
        self.categories.insert(name.into(), delay.as_millis() as u64);
        self
    }

    /// Resolve the policy for a category, falling back to the default.
    pub fn policy(&self, category: Option<&str>) -> DelayPolicy {
        let millis = category
            .and_then(|name| self.categories.get(name))
            .copied()
            .unwrap_or(self.default_delay_ms);
        DelayPolicy::from_millis(millis)
    }
}
