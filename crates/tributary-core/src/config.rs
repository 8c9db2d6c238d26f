//! Engine configuration.
//!
//! Plain typed structs with defaults; an external loader may deserialize
//! them from any source. Feature flags travel with the container rather
//! than being read from the environment, so tests can instantiate several
//! independently configured engines in one process.

use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration injected into the engine container.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Master switch. When false the core is inert and every operation
    /// fails with `Disabled`.
    pub enable_wal: bool,
    pub wal: WalConfig,
    pub cache: SnapshotCacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_wal: true,
            wal: WalConfig::default(),
            cache: SnapshotCacheConfig::default(),
        }
    }
}

/// Append buffer and flush tuning for the WAL store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Entries per page; a full page is sealed and handed to the flusher.
    pub page_size: usize,
    /// Maximum sealed + open pages; total buffered entries are bounded by
    /// `page_size * page_count`, which is the backpressure limit.
    pub page_count: usize,
    /// Background flush cadence when no page fills up first.
    #[serde(with = "humantime_millis")]
    pub flush_interval: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            page_size: 64,
            page_count: 8,
            flush_interval: Duration::from_millis(50),
        }
    }
}

impl WalConfig {
    /// Total buffered-entry capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.page_size * self.page_count
    }
}

/// Materializer snapshot cache tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotCacheConfig {
    /// Disable to force full replay on every materialization.
    pub enabled: bool,
    /// Maximum cached snapshots.
    pub max_entries: u64,
    /// Snapshot time-to-live.
    #[serde(with = "humantime_millis")]
    pub ttl: Duration,
}

impl Default for SnapshotCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 512,
            ttl: Duration::from_secs(300),
        }
    }
}

/// Durations deserialize from integer milliseconds.
mod humantime_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
