/**
 * Configuration constants for the resource cache and watcher
 */
use crate::error::{Error, Result};
use std::time::Duration;
use tracing::warn;

/// Default time-to-live of a cached list, in seconds (5 minutes)
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Default maximum number of cache entries
pub const DEFAULT_MAX_CACHE_SIZE: usize = 10_000;

/// Default interval between proactive expiry sweeps, in seconds
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30;

/// Fixed delay before a broken watch is reopened, in milliseconds
pub const DEFAULT_WATCH_BACKOFF_MS: u64 = 5_000;

/// Capacity of the shared watch event queue; events beyond it are dropped
pub const EVENT_QUEUE_CAPACITY: usize = 1_000;

/// Capacity of each subscriber's own queue; a callback that falls this far
/// behind loses the overflow
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 1_000;

/// Upper bound on every configured duration, in seconds (100 years).
/// Anything longer cannot be added to a monotonic instant on every platform.
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Resource types `refresh_namespace` fetches eagerly, and the types
/// `search_resources` covers when no types are given
pub const REFRESH_RESOURCE_TYPES: [&str; 8] = [
    "pods",
    "services",
    "deployments",
    "replicasets",
    "statefulsets",
    "daemonsets",
    "configmaps",
    "secrets",
];

pub const ENV_CACHE_TTL_SECS: &str = "NAVICACHE_CACHE_TTL_SECS";
pub const ENV_MAX_CACHE_SIZE: &str = "NAVICACHE_MAX_CACHE_SIZE";
pub const ENV_WATCH_ENABLED: &str = "NAVICACHE_WATCH_ENABLED";
pub const ENV_REFRESH_INTERVAL_SECS: &str = "NAVICACHE_REFRESH_INTERVAL_SECS";
pub const ENV_WATCH_BACKOFF_MS: &str = "NAVICACHE_WATCH_BACKOFF_MS";

/// Options recognised by the cache manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// TTL applied to every cached list
    pub cache_ttl: Duration,
    /// Entry count at which LRU eviction starts
    pub max_cache_size: usize,
    /// Start watches and the invalidation loop
    pub watch_enabled: bool,
    /// Period of the expired-entry sweep
    pub refresh_interval: Duration,
    /// Delay before a failed watch is reopened
    pub watch_backoff: Duration,
    /// Capacity of the shared event queue
    pub event_queue_capacity: usize,
    /// Capacity of each subscriber's queue
    pub subscriber_queue_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            watch_enabled: true,
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            watch_backoff: Duration::from_millis(DEFAULT_WATCH_BACKOFF_MS),
            event_queue_capacity: EVENT_QUEUE_CAPACITY,
            subscriber_queue_capacity: SUBSCRIBER_QUEUE_CAPACITY,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    #[must_use]
    pub const fn with_max_cache_size(mut self, size: usize) -> Self {
        self.max_cache_size = size;
        self
    }

    #[must_use]
    pub const fn with_watch_enabled(mut self, enabled: bool) -> Self {
        self.watch_enabled = enabled;
        self
    }

    #[must_use]
    pub const fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_watch_backoff(mut self, backoff: Duration) -> Self {
        self.watch_backoff = backoff;
        self
    }

    #[must_use]
    pub const fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    #[must_use]
    pub const fn with_subscriber_queue_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_queue_capacity = capacity;
        self
    }

    /// Defaults overridden by any `NAVICACHE_*` variables that are set.
    /// Unparseable values are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            raw.trim().parse().map_or_else(
                |_| {
                    warn!("Ignoring {}={}: not a valid value", key, raw);
                    None
                },
                Some,
            )
        }

        let mut config = Self::default();
        if let Some(secs) = parse::<u64>(ENV_CACHE_TTL_SECS, lookup(ENV_CACHE_TTL_SECS)) {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(size) = parse::<usize>(ENV_MAX_CACHE_SIZE, lookup(ENV_MAX_CACHE_SIZE)) {
            config.max_cache_size = size;
        }
        if let Some(enabled) = parse::<bool>(ENV_WATCH_ENABLED, lookup(ENV_WATCH_ENABLED)) {
            config.watch_enabled = enabled;
        }
        if let Some(secs) =
            parse::<u64>(ENV_REFRESH_INTERVAL_SECS, lookup(ENV_REFRESH_INTERVAL_SECS))
        {
            config.refresh_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse::<u64>(ENV_WATCH_BACKOFF_MS, lookup(ENV_WATCH_BACKOFF_MS)) {
            config.watch_backoff = Duration::from_millis(ms);
        }
        config
    }

    /// Reject configurations the manager cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        if self.cache_ttl.is_zero() {
            return Err(Error::InvalidConfig("cache_ttl must be greater than 0".to_string()));
        }
        if self.max_cache_size == 0 {
            return Err(Error::InvalidConfig(
                "max_cache_size must be greater than 0".to_string(),
            ));
        }
        if self.refresh_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "refresh_interval must be greater than 0".to_string(),
            ));
        }
        if self.watch_backoff.is_zero() {
            return Err(Error::InvalidConfig("watch_backoff must be greater than 0".to_string()));
        }
        for (name, value) in [
            ("cache_ttl", self.cache_ttl),
            ("refresh_interval", self.refresh_interval),
            ("watch_backoff", self.watch_backoff),
        ] {
            if value > Duration::from_secs(MAX_DURATION_SECS) {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be at most {MAX_DURATION_SECS}s"
                )));
            }
        }
        if self.event_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "event_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.subscriber_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "subscriber_queue_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(DEFAULT_CACHE_TTL_SECS > 0, "DEFAULT_CACHE_TTL_SECS must be greater than 0");
    assert!(DEFAULT_MAX_CACHE_SIZE > 0, "DEFAULT_MAX_CACHE_SIZE must be greater than 0");
    assert!(DEFAULT_REFRESH_INTERVAL_SECS > 0, "DEFAULT_REFRESH_INTERVAL_SECS must be greater than 0");
    assert!(DEFAULT_WATCH_BACKOFF_MS > 0, "DEFAULT_WATCH_BACKOFF_MS must be greater than 0");
    assert!(EVENT_QUEUE_CAPACITY > 0, "EVENT_QUEUE_CAPACITY must be greater than 0");
    assert!(SUBSCRIBER_QUEUE_CAPACITY > 0, "SUBSCRIBER_QUEUE_CAPACITY must be greater than 0");
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.max_cache_size, 10_000);
        assert!(config.watch_enabled);
        assert_eq!(config.refresh_interval, Duration::from_secs(30));
        assert_eq!(config.watch_backoff, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_size() {
        let config = CacheConfig::default().with_max_cache_size(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        let config = CacheConfig::default().with_subscriber_queue_capacity(0);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_overflowing_durations() {
        let huge = Duration::from_secs(u64::MAX);
        for config in [
            CacheConfig::default().with_cache_ttl(huge),
            CacheConfig::default().with_refresh_interval(huge),
            CacheConfig::default().with_watch_backoff(huge),
        ] {
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        }
        let longest = CacheConfig::default().with_cache_ttl(Duration::from_secs(MAX_DURATION_SECS));
        assert!(longest.validate().is_ok());
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_CACHE_TTL_SECS, "60"),
            (ENV_WATCH_ENABLED, "false"),
            (ENV_MAX_CACHE_SIZE, "lots"),
        ]);
        let config = CacheConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert!(!config.watch_enabled);
        assert_eq!(config.max_cache_size, DEFAULT_MAX_CACHE_SIZE);
    }
}
