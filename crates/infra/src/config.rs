//! Runtime configuration for caching and locking.
//!
//! Both option structs can be built three ways: `Default` plus `with_*` builders,
//! deserialized from a config file, or read from `EVENTLINE_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Cache adapter switches and limits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Bypass the cache entirely (every read calls its loader).
    pub caching_disabled: bool,
    /// Skip the lock around set population.
    pub disable_locking: bool,
    /// Skip the `"{set_key}.ItemsAdd"` lock in `set_items_ensure*`.
    pub disable_secondary_locking: bool,
    /// Skip the lock around value writes in `cache_load*`.
    pub disable_value_locking: bool,
    /// Rethrow loader errors instead of logging them and returning the default.
    pub throw_exceptions: bool,
    #[serde(with = "seconds")]
    pub default_ttl: Duration,
    #[serde(with = "seconds")]
    pub lock_timeout: Duration,
    /// Chunk size for reloading evicted set members.
    pub load_split_size: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            caching_disabled: false,
            disable_locking: false,
            disable_secondary_locking: false,
            disable_value_locking: false,
            throw_exceptions: false,
            default_ttl: Duration::from_secs(3600),
            lock_timeout: Duration::from_secs(10),
            load_split_size: 100,
        }
    }
}

impl CacheOptions {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            caching_disabled: env_or("EVENTLINE_CACHE_DISABLED", defaults.caching_disabled),
            disable_locking: env_or("EVENTLINE_CACHE_DISABLE_LOCKING", defaults.disable_locking),
            disable_secondary_locking: env_or(
                "EVENTLINE_CACHE_DISABLE_SECONDARY_LOCKING",
                defaults.disable_secondary_locking,
            ),
            disable_value_locking: env_or(
                "EVENTLINE_CACHE_DISABLE_VALUE_LOCKING",
                defaults.disable_value_locking,
            ),
            throw_exceptions: env_or("EVENTLINE_CACHE_THROW_EXCEPTIONS", defaults.throw_exceptions),
            default_ttl: Duration::from_secs(env_or(
                "EVENTLINE_CACHE_TTL_SECONDS",
                defaults.default_ttl.as_secs(),
            )),
            lock_timeout: Duration::from_secs(env_or(
                "EVENTLINE_CACHE_LOCK_TIMEOUT_SECONDS",
                defaults.lock_timeout.as_secs(),
            )),
            load_split_size: env_or("EVENTLINE_CACHE_LOAD_SPLIT_SIZE", defaults.load_split_size),
        }
    }

    pub fn with_caching_disabled(mut self, disabled: bool) -> Self {
        self.caching_disabled = disabled;
        self
    }

    pub fn with_disable_locking(mut self, disabled: bool) -> Self {
        self.disable_locking = disabled;
        self
    }

    pub fn with_disable_secondary_locking(mut self, disabled: bool) -> Self {
        self.disable_secondary_locking = disabled;
        self
    }

    pub fn with_disable_value_locking(mut self, disabled: bool) -> Self {
        self.disable_value_locking = disabled;
        self
    }

    pub fn with_throw_exceptions(mut self, throw: bool) -> Self {
        self.throw_exceptions = throw;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_load_split_size(mut self, size: usize) -> Self {
        self.load_split_size = size.max(1);
        self
    }
}

/// Lock provider defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// Expiry of a held lock (a crashed holder cannot block a name forever).
    #[serde(with = "seconds")]
    pub default_ttl: Duration,
    /// How long a caller waits for a held lock.
    #[serde(with = "seconds")]
    pub acquire_timeout: Duration,
    /// Acquire timeout of the `"{set_key}.ItemsAdd"` lock.
    #[serde(with = "seconds")]
    pub set_items_timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(20 * 60),
            acquire_timeout: Duration::from_secs(30),
            set_items_timeout: Duration::from_secs(2),
        }
    }
}

impl LockOptions {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_ttl: Duration::from_secs(env_or(
                "EVENTLINE_LOCK_TTL_SECONDS",
                defaults.default_ttl.as_secs(),
            )),
            acquire_timeout: Duration::from_secs(env_or(
                "EVENTLINE_LOCK_ACQUIRE_TIMEOUT_SECONDS",
                defaults.acquire_timeout.as_secs(),
            )),
            set_items_timeout: Duration::from_secs(env_or(
                "EVENTLINE_LOCK_SET_ITEMS_TIMEOUT_SECONDS",
                defaults.set_items_timeout.as_secs(),
            )),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_set_items_timeout(mut self, timeout: Duration) -> Self {
        self.set_items_timeout = timeout;
        self
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + core::fmt::Debug,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, ?default, "invalid configuration value; using default");
            default
        }),
        Err(_) => default,
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_defaults() {
        let options = CacheOptions::default();
        assert!(!options.caching_disabled);
        assert_eq!(options.default_ttl, Duration::from_secs(3600));
        assert_eq!(options.lock_timeout, Duration::from_secs(10));
        assert_eq!(options.load_split_size, 100);
    }

    #[test]
    fn lock_defaults() {
        let options = LockOptions::default();
        assert_eq!(options.default_ttl, Duration::from_secs(1200));
        assert_eq!(options.acquire_timeout, Duration::from_secs(30));
        assert_eq!(options.set_items_timeout, Duration::from_secs(2));
    }

    #[test]
    fn deserializes_partial_config_with_defaults() {
        let options: CacheOptions =
            serde_json::from_str(r#"{ "caching_disabled": true, "default_ttl": 60 }"#).unwrap();
        assert!(options.caching_disabled);
        assert_eq!(options.default_ttl, Duration::from_secs(60));
        assert_eq!(options.load_split_size, 100);
    }

    #[test]
    fn split_size_never_drops_to_zero() {
        assert_eq!(CacheOptions::default().with_load_split_size(0).load_split_size, 1);
    }
}
