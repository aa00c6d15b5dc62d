//! Security error taxonomy shared by every `tablefence` component.
//!
//! Each variant tells a call site whether it may retry and what the caller
//! is allowed to see. The `reason` strings are for logs and audit only and
//! must never be shown to the caller; use [`SecurityError::public_message`]
//! for anything that leaves the process.

/// Result alias used across the workspace.
pub type SecurityResult<T> = Result<T, SecurityError>;

/// Errors raised by tenant isolation, access checks, and guarded cache calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    /// No principal, or the principal could not be turned into a tenant context.
    #[error("authentication failed: {reason}")]
    Authentication { reason: String },
    /// Valid principal without the tenant scope required for the operation.
    #[error("authorization denied: {reason}")]
    Authorization { reason: String },
    /// Circuit open, backend unreachable, or session binding failed. Retryable.
    #[error("service unavailable: {reason}")]
    ServiceUnavailable { reason: String },
    /// Backend reachable but the specific call failed.
    #[error("operation failed: {reason}")]
    OperationFailed { reason: String },
    /// Invalid or unsafe configuration. Fatal at startup.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },
    /// The calling operation was cancelled or ran past its deadline mid-call.
    #[error("operation cancelled")]
    Cancelled,
}

impl SecurityError {
    pub fn authentication(reason: impl Into<String>) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    pub fn authorization(reason: impl Into<String>) -> Self {
        Self::Authorization {
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            reason: reason.into(),
        }
    }

    pub fn operation_failed(reason: impl Into<String>) -> Self {
        Self::OperationFailed {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Message safe to return to the caller.
    ///
    /// Authorization failures and infrastructure failures share one message so
    /// a caller cannot tell a cross-tenant denial from a cache outage.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::Authentication { .. } => "authentication required",
            Self::Authorization { .. } | Self::ServiceUnavailable { .. } | Self::Cancelled => {
                "request denied"
            }
            Self::OperationFailed { .. } => "temporarily unavailable, try again",
            Self::Configuration { .. } => "internal error",
        }
    }

    /// Whether the same operation may be retried later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable { .. } | Self::OperationFailed { .. }
        )
    }

    /// Re-classifies the error for a security-sensitive call site.
    ///
    /// On rate-limit and session paths an `OperationFailed` carries the same
    /// risk as an outage, so it is folded into `ServiceUnavailable`.
    #[must_use]
    pub fn fail_closed(self) -> Self {
        match self {
            Self::OperationFailed { reason } => Self::ServiceUnavailable { reason },
            other => other,
        }
    }

    /// Short machine-readable label, used as a log field and metrics label.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication { .. } => "authentication",
            Self::Authorization { .. } => "authorization",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::OperationFailed { .. } => "operation_failed",
            Self::Configuration { .. } => "configuration",
            Self::Cancelled => "cancelled",
        }
    }
}
