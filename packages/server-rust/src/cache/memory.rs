//! In-process [`CacheBackend`] with per-key expiry.
//!
//! Backs the permissive mode and the test suites. Expired entries are
//! dropped lazily on access.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::error::CacheError;
use crate::traits::CacheBackend;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) => at > now,
            None => true,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet collected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone());
        if value.is_none() {
            self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                let entry = occupied.get_mut();
                let current: i64 = entry.value.parse().map_err(|_| {
                    CacheError::Operation(format!("value at {key} is not an integer"))
                })?;
                let next = current.checked_add(delta).ok_or_else(|| {
                    CacheError::Operation(format!("increment of {key} would overflow"))
                })?;
                entry.value = next.to_string();
                Ok(next)
            }
            Entry::Occupied(mut expired) => {
                expired.insert(CacheEntry {
                    value: delta.to_string(),
                    expires_at: Some(now + ttl),
                });
                Ok(delta)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry {
                    value: delta.to_string(),
                    expires_at: Some(now + ttl),
                });
                Ok(delta)
            }
        }
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn values_expire() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn incr_starts_a_new_window_after_expiry() {
        let cache = MemoryCache::new();
        let window = Duration::from_secs(60);
        assert_eq!(cache.incr("n", 1, window).await.unwrap(), 1);
        assert_eq!(cache.incr("n", 1, window).await.unwrap(), 2);

        tokio::time::advance(window).await;
        assert_eq!(cache.incr("n", 1, window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn incr_on_non_integer_is_an_operation_error() {
        let cache = MemoryCache::new();
        cache.set("k", "text", None).await.unwrap();
        let err = cache.incr("k", 1, Duration::from_secs(1)).await.unwrap_err();
        assert!(!err.counts_against_circuit());
    }

    #[tokio::test]
    async fn incr_overflow_is_an_operation_error() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        cache.set("n", &i64::MAX.to_string(), None).await.unwrap();
        let err = cache.incr("n", 1, ttl).await.unwrap_err();
        assert!(matches!(err, CacheError::Operation(_)), "{err}");
        assert_eq!(cache.get("n").await.unwrap(), Some(i64::MAX.to_string()));
        assert_eq!(cache.incr("n", -1, ttl).await.unwrap(), i64::MAX - 1);
    }

    #[tokio::test]
    async fn delete_missing_key_is_ok() {
        let cache = MemoryCache::new();
        cache.delete("absent").await.unwrap();
        cache.ping().await.unwrap();
    }
}
