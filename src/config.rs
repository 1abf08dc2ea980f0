//! Global configuration.
//!
//! Mirrors the teacher crate's `config.rs`: a process-wide [`Config`], lazily
//! initialized behind a [`OnceLock<RwLock<Config>>`], read with
//! [`global_config`] and mutated with [`global_config_mut`].

use std::sync::{OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Policy for a `_REFERENCE` whose `source_object_id` does not match the
/// referenced object's actual `object_id` (§9 Open Question (a)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceObjectIdPolicy {
    /// Reject the reference outright.
    Strict,
    /// Log a warning and continue using the reference as given.
    WarnAndContinue,
}

/// Global library configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Datasets whose HDF5 chunk count exceeds this are emitted as
    /// `_EXTERNAL_ARRAY_LINK` instead of an inline chunk listing (§4.3, §9).
    pub external_array_link_chunk_threshold: usize,
    /// Maximum number of attempts the chunk fetcher makes for a single range (§4.4).
    pub fetch_retry_max_attempts: u32,
    /// Initial backoff delay between fetch retries.
    pub fetch_retry_base_delay: Duration,
    /// Maximum backoff delay between fetch retries.
    pub fetch_retry_max_delay: Duration,
    /// How to handle a `_REFERENCE` whose `source_object_id` mismatches.
    pub reference_source_object_id_policy: ReferenceObjectIdPolicy,
    /// Optional cap on the on-disk chunk cache, in bytes. `None` disables eviction.
    pub disk_cache_capacity_bytes: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            external_array_link_chunk_threshold: 1_000_000,
            fetch_retry_max_attempts: 6,
            fetch_retry_base_delay: Duration::from_millis(500),
            fetch_retry_max_delay: Duration::from_secs(30),
            reference_source_object_id_policy: ReferenceObjectIdPolicy::WarnAndContinue,
            disk_cache_capacity_bytes: None,
        }
    }
}

static CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

fn config() -> &'static RwLock<Config> {
    CONFIG.get_or_init(|| RwLock::new(Config::default()))
}

/// Returns a read guard to the global configuration.
///
/// # Panics
/// Panics if the lock is poisoned.
#[must_use]
pub fn global_config() -> RwLockReadGuard<'static, Config> {
    config().read().unwrap()
}

/// Returns a write guard to the global configuration.
///
/// # Panics
/// Panics if the lock is poisoned.
#[must_use]
pub fn global_config_mut() -> RwLockWriteGuard<'static, Config> {
    config().write().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = global_config();
        assert_eq!(config.fetch_retry_max_attempts, 6);
        assert_eq!(config.external_array_link_chunk_threshold, 1_000_000);
    }

    #[test]
    fn mutation_is_visible() {
        {
            let mut config = global_config_mut();
            config.external_array_link_chunk_threshold = 42;
        }
        assert_eq!(global_config().external_array_link_chunk_threshold, 42);
        global_config_mut().external_array_link_chunk_threshold = 1_000_000;
    }
}
