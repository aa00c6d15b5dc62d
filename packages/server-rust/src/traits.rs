use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tablefence_core::{RestaurantId, SecurityError, UserId};

use crate::access::AuditRecord;
use crate::cache::CacheError;

/// Durable source of explicit multi-restaurant grants.
/// Implementations: in-memory (tests, single node), SQL-backed (deployment).
#[async_trait]
pub trait GrantStore: Send + Sync {
    /// Restaurants explicitly granted to `user`, excluding the user's own
    /// legacy restaurant binding.
    ///
    /// Any failure must be returned as an error; the guard treats it as a denial.
    async fn granted_restaurants(
        &self,
        user: &UserId,
    ) -> Result<BTreeSet<RestaurantId>, SecurityError>;
}

/// Destination for access audit records.
/// Emission is synchronous and must not fail the request it describes.
pub trait AuditSink: Send + Sync {
    /// Record one access decision.
    fn record(&self, record: &AuditRecord);
}

/// Key-value backend behind [`ResilientCache`](crate::cache::ResilientCache).
/// Implementations: Redis (feature `redis`), memory (tests, permissive mode).
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short label reported by the health endpoint (e.g. `redis`, `memory`).
    fn kind(&self) -> &'static str;

    /// Fetch a value, `None` if the key is missing or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store a value with an optional time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Remove a key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Atomically add `delta` and return the new value. When the key is
    /// created by this call it expires after `ttl`.
    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError>;

    /// Round-trip liveness check.
    async fn ping(&self) -> Result<(), CacheError>;
}
