//! tablefence server: tenant isolation for pooled database connections,
//! application-level access control, a fail-closed cache, and connection
//! admission.
//!
//! - [`context`]: per-operation [`ContextCarrier`](context::ContextCarrier)
//! - [`db`]: session-variable binding and the tenant-aware pool
//! - [`access`]: [`TenantAccessGuard`](access::TenantAccessGuard) and query scoping
//! - [`cache`]: [`ResilientCache`](cache::ResilientCache) and its circuit breaker
//! - [`network`]: registry, admission control, health surface, shutdown

pub mod access;
pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod network;
pub mod telemetry;
pub mod traits;

pub use config::{DatabaseConfig, Environment, ServerConfig};
pub use traits::{AuditSink, CacheBackend, GrantStore};
