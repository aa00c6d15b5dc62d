//! Cache and circuit-breaker configuration.

use std::time::Duration;

use serde::Deserialize;

/// How the cache layer is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Real backend behind a fail-closed circuit breaker.
    #[default]
    Production,
    /// In-process store in place of the real backend. It cannot become
    /// unavailable, so nothing ever fails closed. Rejected in production
    /// environments and announced at startup.
    Permissive,
}

/// Circuit-breaker thresholds.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in `closed` that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive successes in `half_open` that close it again.
    pub success_threshold: u32,
    /// How long the circuit stays open before probing.
    pub open_timeout: Duration,
    /// Concurrent probe calls admitted while `half_open`.
    pub half_open_max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            half_open_max_probes: 1,
        }
    }
}

/// Cache backend configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub mode: CacheMode,
    /// Backend URL, e.g. `redis://127.0.0.1:6379`. Unused in permissive mode.
    pub url: Option<String>,
    /// Upper bound on any single backend call; exceeding it counts as unavailability.
    pub operation_timeout: Duration,
    /// Prefix for every key written by this process.
    pub key_prefix: String,
    pub session_ttl: Duration,
    /// Lifetime of a pending two-factor challenge.
    pub two_factor_ttl: Duration,
    pub breaker: BreakerConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Production,
            url: None,
            operation_timeout: Duration::from_millis(500),
            key_prefix: "tablefence".to_string(),
            session_ttl: Duration::from_secs(3600),
            two_factor_ttl: Duration::from_secs(300),
            breaker: BreakerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_fail_closed() {
        let config = CacheConfig::default();
        assert_eq!(config.mode, CacheMode::Production);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.success_threshold, 2);
        assert_eq!(config.breaker.open_timeout, Duration::from_secs(30));
    }

    #[test]
    fn mode_deserializes_from_snake_case() {
        let mode: CacheMode = serde_json::from_str("\"permissive\"").unwrap();
        assert_eq!(mode, CacheMode::Permissive);
    }
}
