use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration of the store-backed namespace lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Time-to-live of a namespace lease in milliseconds.
    pub ttl_ms: u64,
    /// Maximum time to wait for all leases of a lock request.
    pub acquire_timeout_ms: u64,
    /// Initial backoff between attempts in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff between attempts in milliseconds.
    pub max_backoff_ms: u64,
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,             // 30 seconds
            acquire_timeout_ms: 10_000, // 10 seconds
            initial_backoff_ms: 10,
            max_backoff_ms: 1_000,
        }
    }
}

/// Configuration for a [`Backend`] and all its sub-components.
///
/// [`Backend`]: crate::Backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub lock: LockConfig,
}

impl BackendConfig {
    /// A config tuned for fast testing.
    ///
    /// - **lock:** Short leases and timeouts make contention tests finish quickly.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            lock: LockConfig {
                ttl_ms: 2_000,
                acquire_timeout_ms: 200,
                initial_backoff_ms: 5,
                max_backoff_ms: 20,
            },
        }
    }
}
