use tablefence_core::SecurityError;

/// Failure of a single cache backend call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Backend unreachable, timed out, or connection dropped. Counts
    /// against the circuit breaker.
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    /// Backend answered but rejected this call (wrong type, bad argument).
    /// Says nothing about backend health.
    #[error("cache operation failed: {0}")]
    Operation(String),
}

impl CacheError {
    #[must_use]
    pub fn counts_against_circuit(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<CacheError> for SecurityError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Unavailable(reason) => SecurityError::unavailable(reason),
            CacheError::Operation(reason) => SecurityError::operation_failed(reason),
        }
    }
}
