//! Fail-closed cache facade used for rate limiting and ephemeral session state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tablefence_core::SecurityError;
use tracing::warn;

use super::breaker::{CircuitBreaker, CircuitState};
use super::config::{CacheConfig, CacheMode};
use super::error::CacheError;
use super::memory::MemoryCache;
use crate::config::Environment;
use crate::traits::CacheBackend;

/// Why a rate-limited call was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyCause {
    LimitExceeded,
    /// The counter could not be read; the call is refused rather than admitted.
    CacheUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allow { remaining: u64 },
    Deny(DenyCause),
}

impl RateDecision {
    #[must_use]
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Snapshot served by `GET /health/cache`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheHealth {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub backend: &'static str,
    /// `true` when the backend is the in-process permissive store.
    pub permissive: bool,
}

/// Cache wrapper that routes every call through a [`CircuitBreaker`] and a
/// per-call timeout.
///
/// Security-relevant helpers never fail open: rate checks deny and session
/// reads report "absent" whenever the backend cannot answer.
pub struct ResilientCache {
    backend: Arc<dyn CacheBackend>,
    breaker: CircuitBreaker,
    config: CacheConfig,
    permissive: bool,
}

impl ResilientCache {
    /// Wraps a real backend in fail-closed mode.
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        let breaker = CircuitBreaker::new(config.breaker.clone());
        Self {
            backend,
            breaker,
            config,
            permissive: false,
        }
    }

    /// In-process permissive store. Never use in production.
    #[must_use]
    pub fn permissive(config: CacheConfig) -> Self {
        warn!("=====================================================================");
        warn!("PERMISSIVE CACHE MODE: rate limits and sessions are process-local");
        warn!("and cache outages cannot be detected. Not for production use.");
        warn!("=====================================================================");
        let mut cache = Self::new(Arc::new(MemoryCache::new()), config);
        cache.permissive = true;
        cache
    }

    /// Builds the cache described by `config` for `environment`.
    ///
    /// # Errors
    ///
    /// - `Configuration` when permissive mode is requested in production, no
    ///   URL is configured, or the binary was built without a backend driver
    /// - `ServiceUnavailable` when the backend cannot be reached at startup
    pub async fn connect(
        config: CacheConfig,
        environment: Environment,
    ) -> Result<Self, SecurityError> {
        match config.mode {
            CacheMode::Permissive if environment.is_production() => Err(
                SecurityError::configuration("permissive cache mode is not allowed in production"),
            ),
            CacheMode::Permissive => Ok(Self::permissive(config)),
            CacheMode::Production => {
                let url = config.url.clone().ok_or_else(|| {
                    SecurityError::configuration("cache url is required in production mode")
                })?;
                let backend = connect_backend(&url).await?;
                Ok(Self::new(backend, config))
            }
        }
    }

    #[must_use]
    pub fn is_permissive(&self) -> bool {
        self.permissive
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    #[must_use]
    pub fn health(&self) -> CacheHealth {
        let snapshot = self.breaker.snapshot();
        CacheHealth {
            state: snapshot.state,
            failure_count: snapshot.failure_count,
            success_count: snapshot.success_count,
            backend: self.backend.kind(),
            permissive: self.permissive,
        }
    }

    /// Pings the backend through the breaker, then reports health.
    ///
    /// An open circuit whose timeout has elapsed uses this ping as its probe.
    pub async fn check_health(&self) -> CacheHealth {
        if let Err(err) = self.ping().await {
            warn!(error = %err, "cache health ping failed");
        }
        self.health()
    }

    // ------------------------------------------------------------------
    // Raw operations
    // ------------------------------------------------------------------

    /// # Errors
    ///
    /// `ServiceUnavailable` when the circuit is open, the backend is
    /// unreachable, or the call times out; `OperationFailed` otherwise.
    pub async fn get(&self, key: &str) -> Result<Option<String>, SecurityError> {
        self.guarded("get", self.backend.get(key)).await
    }

    /// # Errors
    ///
    /// As for [`get`](Self::get).
    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), SecurityError> {
        self.guarded("set", self.backend.set(key, value, ttl)).await
    }

    /// # Errors
    ///
    /// As for [`get`](Self::get).
    pub async fn delete(&self, key: &str) -> Result<(), SecurityError> {
        self.guarded("delete", self.backend.delete(key)).await
    }

    /// # Errors
    ///
    /// As for [`get`](Self::get).
    pub async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, SecurityError> {
        self.guarded("incr", self.backend.incr(key, delta, ttl)).await
    }

    /// # Errors
    ///
    /// As for [`get`](Self::get).
    pub async fn ping(&self) -> Result<(), SecurityError> {
        self.guarded("ping", self.backend.ping()).await
    }

    // ------------------------------------------------------------------
    // Security helpers (fail closed)
    // ------------------------------------------------------------------

    /// Fixed-window counter: admits at most `limit` calls per `window` for `key`.
    ///
    /// Any failure to read or bump the counter denies.
    pub async fn check_rate_limit(&self, key: &str, limit: u64, window: Duration) -> RateDecision {
        let counter_key = self.key("rl", key);
        match self.incr(&counter_key, 1, window).await {
            Ok(count) => {
                let Ok(count) = u64::try_from(count) else {
                    metrics::counter!("tablefence_rate_limit_denied_total", "cause" => "invalid")
                        .increment(1);
                    warn!(key, count, "rate limit counter is negative; denying");
                    return RateDecision::Deny(DenyCause::CacheUnavailable);
                };
                if count > limit {
                    metrics::counter!("tablefence_rate_limit_denied_total", "cause" => "limit")
                        .increment(1);
                    RateDecision::Deny(DenyCause::LimitExceeded)
                } else {
                    RateDecision::Allow {
                        remaining: limit - count,
                    }
                }
            }
            Err(err) => {
                metrics::counter!("tablefence_rate_limit_denied_total", "cause" => "unavailable")
                    .increment(1);
                warn!(key, error = %err, "rate limit check failed; denying");
                RateDecision::Deny(DenyCause::CacheUnavailable)
            }
        }
    }

    /// Session payload for `session_id`. `None` when absent *or* unreadable.
    pub async fn get_session(&self, session_id: &str) -> Option<String> {
        self.read_or_absent("session", self.session_key(session_id)).await
    }

    /// Stores a session payload with the configured session TTL.
    ///
    /// # Errors
    ///
    /// `ServiceUnavailable` on any cache failure.
    pub async fn set_session(&self, session_id: &str, payload: &str) -> Result<(), SecurityError> {
        let key = self.session_key(session_id);
        self.set(&key, payload, Some(self.config.session_ttl))
            .await
            .map_err(SecurityError::fail_closed)
    }

    /// # Errors
    ///
    /// `ServiceUnavailable` on any cache failure.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), SecurityError> {
        let key = self.session_key(session_id);
        self.delete(&key).await.map_err(SecurityError::fail_closed)
    }

    /// Records a pending two-factor challenge for `user_id`.
    ///
    /// # Errors
    ///
    /// `ServiceUnavailable` on any cache failure.
    pub async fn set_two_factor_pending(
        &self,
        user_id: &str,
        challenge: &str,
    ) -> Result<(), SecurityError> {
        let key = self.key("2fa", user_id);
        self.set(&key, challenge, Some(self.config.two_factor_ttl))
            .await
            .map_err(SecurityError::fail_closed)
    }

    /// Pending challenge for `user_id`. `None` when absent or unreadable, in
    /// which case the caller must restart the two-factor flow.
    pub async fn get_two_factor_pending(&self, user_id: &str) -> Option<String> {
        self.read_or_absent("2fa", self.key("2fa", user_id)).await
    }

    /// # Errors
    ///
    /// `ServiceUnavailable` on any cache failure.
    pub async fn clear_two_factor_pending(&self, user_id: &str) -> Result<(), SecurityError> {
        let key = self.key("2fa", user_id);
        self.delete(&key).await.map_err(SecurityError::fail_closed)
    }

    // ------------------------------------------------------------------

    fn key(&self, namespace: &str, key: &str) -> String {
        format!("{}:{namespace}:{key}", self.config.key_prefix)
    }

    /// Session ids are bearer credentials; only their digest reaches the backend.
    fn session_key(&self, session_id: &str) -> String {
        let digest = Sha256::digest(session_id.as_bytes());
        self.key("session", &hex::encode(digest))
    }

    async fn read_or_absent(&self, namespace: &str, key: String) -> Option<String> {
        match self.get(&key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(namespace, error = %err, "cache read failed; treating as absent");
                None
            }
        }
    }

    /// Runs `call` through the breaker. `call` is not polled when the circuit
    /// short-circuits, so the backend is never contacted.
    async fn guarded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, SecurityError> {
        let Some(permit) = self.breaker.try_acquire() else {
            return Err(SecurityError::unavailable(format!(
                "cache circuit open; {op} short-circuited"
            )));
        };
        match tokio::time::timeout(self.config.operation_timeout, call).await {
            Ok(Ok(value)) => {
                permit.success();
                Ok(value)
            }
            Ok(Err(err)) if err.counts_against_circuit() => {
                permit.failure();
                Err(err.into())
            }
            Ok(Err(err)) => {
                drop(permit);
                Err(err.into())
            }
            Err(_elapsed) => {
                permit.failure();
                Err(SecurityError::unavailable(format!("cache {op} timed out")))
            }
        }
    }
}

impl std::fmt::Debug for ResilientCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientCache")
            .field("backend", &self.backend.kind())
            .field("state", &self.breaker.state())
            .field("permissive", &self.permissive)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "redis")]
async fn connect_backend(url: &str) -> Result<Arc<dyn CacheBackend>, SecurityError> {
    let cache = super::redis::RedisCache::connect(url).await?;
    Ok(Arc::new(cache))
}

#[cfg(not(feature = "redis"))]
#[allow(clippy::unused_async)]
async fn connect_backend(_url: &str) -> Result<Arc<dyn CacheBackend>, SecurityError> {
    tracing::error!("cache url configured but this build has no cache driver (enable feature `redis`)");
    Err(SecurityError::configuration(
        "no cache backend driver compiled in",
    ))
}
