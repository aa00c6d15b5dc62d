//! Admission control for long-lived connections.

use std::net::SocketAddr;
use std::sync::Arc;

use tablefence_core::{SecurityError, UserId};
use tracing::{info, warn};

use super::config::AdmissionConfig;
use super::registry::{ConnectionId, ConnectionRegistry, RegistryEntry, RegistryError};
use crate::cache::{DenyCause, RateDecision, ResilientCache};

/// Gatekeeper for new connections: per-identity cap plus a cache-backed
/// connection-rate limit.
///
/// The rate limit fails closed, so while the cache circuit is open no new
/// connections are admitted. Existing connections are unaffected.
pub struct AdmissionController {
    registry: Arc<ConnectionRegistry>,
    cache: Arc<ResilientCache>,
    config: AdmissionConfig,
}

impl AdmissionController {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        cache: Arc<ResilientCache>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            config,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Admits and registers a connection.
    ///
    /// # Errors
    ///
    /// - `Authorization` when `identity` already holds the maximum number of
    ///   connections or exceeded the connection rate
    /// - `ServiceUnavailable` when the rate counter cannot be read
    /// - `OperationFailed` when the pair is already registered
    pub async fn admit(
        &self,
        connection_id: ConnectionId,
        identity: UserId,
        remote_addr: SocketAddr,
    ) -> Result<(), SecurityError> {
        let max = self.config.max_connections_per_identity;
        // Fast path only; `register_capped` below is what enforces the cap.
        let held = self.registry.connection_count(&identity);
        if held >= max {
            return Err(Self::cap_reached(RegistryError::CapReached { identity, held }));
        }

        let key = format!("conn:{identity}");
        match self
            .cache
            .check_rate_limit(&key, self.config.connection_rate_limit, self.config.rate_window)
            .await
        {
            RateDecision::Allow { .. } => {}
            RateDecision::Deny(DenyCause::LimitExceeded) => {
                metrics::counter!("tablefence_admission_denied_total", "cause" => "rate")
                    .increment(1);
                return Err(SecurityError::authorization(format!(
                    "{identity} exceeded the connection rate"
                )));
            }
            RateDecision::Deny(DenyCause::CacheUnavailable) => {
                metrics::counter!("tablefence_admission_denied_total", "cause" => "unavailable")
                    .increment(1);
                return Err(SecurityError::unavailable(
                    "connection rate limit unavailable",
                ));
            }
        }

        match self
            .registry
            .register_capped(connection_id, identity.clone(), remote_addr, max)
        {
            Ok(()) => {}
            Err(err @ RegistryError::CapReached { .. }) => return Err(Self::cap_reached(err)),
            Err(err) => return Err(err.into()),
        }
        info!(%connection_id, %identity, %remote_addr, "connection admitted");
        Ok(())
    }

    fn cap_reached(err: RegistryError) -> SecurityError {
        warn!(error = %err, "connection cap reached");
        metrics::counter!("tablefence_admission_denied_total", "cause" => "cap").increment(1);
        err.into()
    }

    /// Releases a connection admitted with the same pair.
    ///
    /// # Errors
    ///
    /// `OperationFailed` when the pair is not registered.
    pub fn release(
        &self,
        connection_id: ConnectionId,
        identity: &UserId,
    ) -> Result<RegistryEntry, SecurityError> {
        Ok(self.registry.unregister(connection_id, identity)?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::cache::{CacheConfig, CacheError, MemoryCache};
    use crate::traits::CacheBackend;

    fn addr() -> SocketAddr {
        "10.0.0.1:5000".parse().unwrap()
    }

    fn controller(max: usize, rate: u64) -> AdmissionController {
        let cache = Arc::new(ResilientCache::permissive(CacheConfig::default()));
        AdmissionController::new(
            Arc::new(ConnectionRegistry::new()),
            cache,
            AdmissionConfig {
                max_connections_per_identity: max,
                connection_rate_limit: rate,
                rate_window: Duration::from_secs(60),
            },
        )
    }

    #[tokio::test]
    async fn enforces_per_identity_cap() {
        let admission = controller(2, 100);
        let alice = UserId::new("alice");
        admission.admit(ConnectionId(1), alice.clone(), addr()).await.unwrap();
        admission.admit(ConnectionId(2), alice.clone(), addr()).await.unwrap();
        let err = admission
            .admit(ConnectionId(3), alice.clone(), addr())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "authorization");

        admission.release(ConnectionId(1), &alice).unwrap();
        admission.admit(ConnectionId(3), alice, addr()).await.unwrap();
    }

    /// Memory cache that suspends before every increment, so concurrent
    /// admissions interleave between the rate check and registration.
    #[derive(Default)]
    struct YieldingCache {
        inner: MemoryCache,
    }

    #[async_trait]
    impl CacheBackend for YieldingCache {
        fn kind(&self) -> &'static str {
            "yielding"
        }
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<(), CacheError> {
            self.inner.delete(key).await
        }
        async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64, CacheError> {
            tokio::task::yield_now().await;
            self.inner.incr(key, delta, ttl).await
        }
        async fn ping(&self) -> Result<(), CacheError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_admissions_respect_the_cap() {
        let cache = Arc::new(ResilientCache::new(
            Arc::new(YieldingCache::default()),
            CacheConfig::default(),
        ));
        let admission = AdmissionController::new(
            Arc::new(ConnectionRegistry::new()),
            cache,
            AdmissionConfig {
                max_connections_per_identity: 1,
                connection_rate_limit: 100,
                rate_window: Duration::from_secs(60),
            },
        );
        let alice = UserId::new("alice");

        let (first, second) = tokio::join!(
            admission.admit(ConnectionId(1), alice.clone(), addr()),
            admission.admit(ConnectionId(2), alice.clone(), addr()),
        );
        assert_eq!(u8::from(first.is_ok()) + u8::from(second.is_ok()), 1);
        let denied = first.err().or(second.err()).unwrap();
        assert_eq!(denied.kind(), "authorization");
        assert_eq!(admission.registry().connection_count(&alice), 1);
        assert_eq!(admission.registry().count(), 1);
    }

    #[tokio::test]
    async fn enforces_connection_rate() {
        let admission = controller(100, 2);
        let bob = UserId::new("bob");
        for id in 1..=2 {
            admission.admit(ConnectionId(id), bob.clone(), addr()).await.unwrap();
            admission.release(ConnectionId(id), &bob).unwrap();
        }
        assert!(admission.admit(ConnectionId(3), bob, addr()).await.is_err());
    }

    #[tokio::test]
    async fn release_requires_matching_pair() {
        let admission = controller(5, 5);
        admission
            .admit(ConnectionId(1), UserId::new("alice"), addr())
            .await
            .unwrap();
        assert!(admission.release(ConnectionId(1), &UserId::new("bob")).is_err());
        assert_eq!(admission.registry().count(), 1);
    }
}
