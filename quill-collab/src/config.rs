//! Tunables for a document session.
//!
//! Every knob has a production default; `for_testing()` shrinks the timers
//! so integration tests run in milliseconds.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Sync relay and presence timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Re-issue the sync request this often while peers are present.
    pub resync_interval: Duration,
    /// A silent remote session is expired after this long.
    pub presence_timeout: Duration,
    /// How often presence renewal and expiry are checked.
    pub presence_check_interval: Duration,
    /// First reconnect delay after a disconnect; doubles per failed attempt.
    pub reconnect_base: Duration,
    /// Cap on the reconnect delay.
    pub reconnect_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
            presence_timeout: Duration::from_secs(30),
            presence_check_interval: Duration::from_secs(3),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    pub fn for_testing() -> Self {
        Self {
            resync_interval: Duration::from_millis(500),
            presence_timeout: Duration::from_secs(2),
            presence_check_interval: Duration::from_millis(100),
            reconnect_base: Duration::from_millis(50),
            reconnect_max: Duration::from_millis(400),
        }
    }

    /// Reconnect delay after `failures` consecutive failed attempts.
    pub fn reconnect_delay(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.reconnect_base.saturating_mul(factor).min(self.reconnect_max)
    }
}

/// Persistence engine thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceConfig {
    /// Quiet period after the last local edit before buffered edits are appended.
    pub debounce: Duration,
    /// Compact after this many appends since the last compaction.
    pub compact_after_appends: u32,
    /// Compact once this much time has passed since the last compaction.
    pub compact_after: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            compact_after_appends: 50,
            compact_after: Duration::from_secs(5 * 60),
        }
    }
}

impl PersistenceConfig {
    pub fn for_testing() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Upper bound on the flush performed while closing.
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            close_timeout: Duration::from_secs(1),
        }
    }
}

/// All tunables of a document session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollabConfig {
    pub sync: SyncConfig,
    pub persistence: PersistenceConfig,
    pub retry: RetryPolicy,
    pub session: SessionConfig,
}

impl CollabConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            sync: SyncConfig::for_testing(),
            persistence: PersistenceConfig::for_testing(),
            retry: RetryPolicy {
                retries: 2,
                base_delay: Duration::from_millis(10),
            },
            session: SessionConfig::for_testing(),
        }
    }
}
