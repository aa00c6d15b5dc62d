//! Top-level server configuration and startup validation.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tablefence_core::{PlatformOwnerPolicy, SecurityError};
use tracing::warn;

use crate::cache::{CacheConfig, CacheMode};
use crate::db::VariableScoping;
use crate::network::{AdmissionConfig, NetworkConfig};
use crate::telemetry::LogFormat;

/// Deployment environment. Only `Production` forbids the permissive cache
/// and requires a platform-owner allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Production,
    Staging,
    Development,
    Test,
}

impl Environment {
    #[must_use]
    pub fn is_production(self) -> bool {
        self == Self::Production
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Development => "development",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown environment: {0}")]
pub struct UnknownEnvironment(String);

impl FromStr for Environment {
    type Err = UnknownEnvironment;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "staging" => Ok(Self::Staging),
            "development" | "dev" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            other => Err(UnknownEnvironment(other.to_string())),
        }
    }
}

/// Tenant database settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Postgres URL. `None` runs against the in-memory engine.
    pub url: Option<String>,
    pub pool_size: usize,
    pub scoping: VariableScoping,
    /// Budget given to each operation's carrier; `None` for no deadline.
    pub operation_budget: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: 10,
            scoping: VariableScoping::TransactionLocal,
            operation_budget: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub environment: Environment,
    /// Emails allowed to act as platform owner.
    pub platform_owner_emails: Vec<String>,
    pub log_format: LogFormat,
    /// Prometheus scrape listener. `None` disables the exporter.
    pub metrics_addr: Option<SocketAddr>,
    pub network: NetworkConfig,
    pub admission: AdmissionConfig,
    pub cache: CacheConfig,
    pub database: DatabaseConfig,
}

impl ServerConfig {
    /// Rejects configurations that would weaken tenant isolation or make
    /// the breaker meaningless.
    ///
    /// # Errors
    ///
    /// Returns `SecurityError::Configuration` naming the first problem found.
    pub fn validate(&self) -> Result<(), SecurityError> {
        if self.environment.is_production() {
            if self.platform_owner_policy().is_empty() {
                return Err(SecurityError::configuration(
                    "platform owner allow-list must not be empty in production",
                ));
            }
            if self.cache.mode == CacheMode::Permissive {
                return Err(SecurityError::configuration(
                    "permissive cache mode is not allowed in production",
                ));
            }
        }

        let breaker = &self.cache.breaker;
        let zero = [
            ("cache.breaker.failure_threshold", breaker.failure_threshold == 0),
            ("cache.breaker.success_threshold", breaker.success_threshold == 0),
            ("cache.breaker.half_open_max_probes", breaker.half_open_max_probes == 0),
            ("cache.operation_timeout", self.cache.operation_timeout.is_zero()),
            ("database.pool_size", self.database.pool_size == 0),
            (
                "admission.max_connections_per_identity",
                self.admission.max_connections_per_identity == 0,
            ),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(SecurityError::configuration(format!("{name} must be positive")));
        }
        Ok(())
    }

    /// The allow-list as a policy. Warns outside production when it is empty,
    /// since nobody can then act as platform owner.
    #[must_use]
    pub fn platform_owner_policy(&self) -> PlatformOwnerPolicy {
        let policy = PlatformOwnerPolicy::new(&self.platform_owner_emails);
        if policy.is_empty() && !self.environment.is_production() {
            warn!(environment = %self.environment, "platform owner allow-list is empty");
        }
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn production() -> ServerConfig {
        ServerConfig {
            platform_owner_emails: vec!["ops@platform.test".to_string()],
            ..ServerConfig::default()
        }
    }

    #[test]
    fn production_defaults_with_allow_list_are_valid() {
        production().validate().unwrap();
    }

    #[test]
    fn production_requires_allow_list() {
        let config = ServerConfig {
            platform_owner_emails: vec!["   ".to_string()],
            ..ServerConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().kind(), "configuration");
    }

    #[test]
    fn production_rejects_permissive_cache() {
        let mut config = production();
        config.cache.mode = CacheMode::Permissive;
        assert!(config.validate().is_err());

        config.environment = Environment::Development;
        config.validate().unwrap();
    }

    #[test]
    fn zero_thresholds_are_rejected() {
        let mut config = production();
        config.cache.breaker.failure_threshold = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("failure_threshold"), "{err}");

        let mut config = production();
        config.database.pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn environment_parses_aliases() {
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("Development".parse::<Environment>().unwrap(), Environment::Development);
        assert!("qa".parse::<Environment>().is_err());
    }
}
