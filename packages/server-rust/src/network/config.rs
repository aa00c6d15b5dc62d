//! Network and admission configuration.

use std::time::Duration;

/// HTTP surface configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Allowed CORS origins. `"*"` allows any.
    pub cors_origins: Vec<String>,
    /// Maximum time to wait for a request to complete.
    pub request_timeout: Duration,
    /// How long in-flight requests may drain after shutdown is triggered.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Limits applied when a long-lived connection is opened.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Concurrent connections one identity may hold.
    pub max_connections_per_identity: usize,
    /// New connections one identity may open per `rate_window`.
    pub connection_rate_limit: u64,
    pub rate_window: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_connections_per_identity: 10,
            connection_rate_limit: 30,
            rate_window: Duration::from_secs(60),
        }
    }
}
