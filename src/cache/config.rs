//! Cache configuration.
//!
//! Mirrors the `[cache]` section of `tagcache.toml`.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_VERSION: u64 = 1;
const DEFAULT_TTL_SECS: u64 = 60 * 60;
const DEFAULT_GRID_TTL_SECS: u64 = 30 * 60;
const DEFAULT_OUTPUT_TTL_SECS: u64 = 60 * 60;
const DEFAULT_EVENT_QUEUE_LIMIT: usize = 1024;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 5000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false every lookup misses and every write is skipped.
    pub enabled: bool,
    /// Initial version stamp embedded in keys.
    pub version: u64,
    pub default_ttl_secs: u64,
    /// TTL for grid records.
    pub grid_ttl_secs: u64,
    /// TTL for rendered grid output.
    pub output_ttl_secs: u64,
    /// Pending events kept before the oldest is dropped.
    pub event_queue_limit: usize,
    /// Maximum events per consumption batch.
    pub consume_batch_limit: usize,
    /// Interval (ms) for background consumption.
    pub auto_consume_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            version: DEFAULT_VERSION,
            default_ttl_secs: DEFAULT_TTL_SECS,
            grid_ttl_secs: DEFAULT_GRID_TTL_SECS,
            output_ttl_secs: DEFAULT_OUTPUT_TTL_SECS,
            event_queue_limit: DEFAULT_EVENT_QUEUE_LIMIT,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            auto_consume_interval_ms: DEFAULT_AUTO_CONSUME_INTERVAL_MS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            version: settings.version,
            default_ttl_secs: settings.default_ttl.as_secs(),
            grid_ttl_secs: settings.grid_ttl.as_secs(),
            output_ttl_secs: settings.output_ttl.as_secs(),
            event_queue_limit: settings.event_queue_limit.get(),
            consume_batch_limit: settings.consume_batch_limit.get(),
            auto_consume_interval_ms: settings.auto_consume_interval.as_millis() as u64,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn grid_ttl(&self) -> Duration {
        Duration::from_secs(self.grid_ttl_secs)
    }

    pub fn output_ttl(&self) -> Duration {
        Duration::from_secs(self.output_ttl_secs)
    }

    pub fn auto_consume_interval(&self) -> Duration {
        Duration::from_millis(self.auto_consume_interval_ms)
    }

    /// Queue limit clamped to at least one slot.
    pub fn event_queue_limit_non_zero(&self) -> usize {
        self.event_queue_limit.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.version, 1);
        assert_eq!(config.default_ttl(), Duration::from_secs(3600));
        assert_eq!(config.grid_ttl(), Duration::from_secs(1800));
        assert_eq!(config.output_ttl(), Duration::from_secs(3600));
        assert_eq!(config.event_queue_limit, 1024);
        assert_eq!(config.consume_batch_limit, 100);
        assert_eq!(config.auto_consume_interval(), Duration::from_millis(5000));
    }

    #[test]
    fn queue_limit_clamps_to_one() {
        let config = CacheConfig {
            event_queue_limit: 0,
            ..Default::default()
        };
        assert_eq!(config.event_queue_limit_non_zero(), 1);
    }
}
