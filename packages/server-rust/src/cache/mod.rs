//! Fail-closed cache layer.
//!
//! [`ResilientCache`] wraps a [`CacheBackend`](crate::traits::CacheBackend)
//! in a [`CircuitBreaker`] and exposes the rate-limit and session helpers the
//! security layer relies on.

pub mod breaker;
pub mod config;
pub mod error;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod resilient;

pub use breaker::{BreakerSnapshot, CallPermit, CircuitBreaker, CircuitState};
pub use config::{BreakerConfig, CacheConfig, CacheMode};
pub use error::CacheError;
pub use memory::MemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;
pub use resilient::{CacheHealth, DenyCause, RateDecision, ResilientCache};
