use async_trait::async_trait;
use tablefence_core::SecurityError;

/// Lifetime of a session-variable assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableScope {
    /// Undone automatically at commit or rollback (`set_config(.., true)`).
    Transaction,
    /// Persists on the physical connection until explicitly reset.
    Session,
}

/// Errors from a physical connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DbError {
    /// The connection is broken or unreachable.
    #[error("connection error: {0}")]
    Connection(String),
    /// A statement was rejected by the engine.
    #[error("statement failed: {0}")]
    Statement(String),
    /// The setting name is not a plain dotted identifier.
    #[error("invalid setting name: {0}")]
    InvalidSetting(String),
}

impl From<DbError> for SecurityError {
    fn from(err: DbError) -> Self {
        // Every database failure on the binding path is infrastructure, and retryable.
        SecurityError::unavailable(err.to_string())
    }
}

/// Minimal statement surface the tenant layer needs from a physical connection.
///
/// Everything else the ORM does goes through the concrete connection type,
/// which [`TenantTransaction::connection`](super::TenantTransaction::connection)
/// exposes once the session is bound.
#[async_trait]
pub trait SessionConnection: Send + 'static {
    /// Opens a transaction.
    async fn begin(&mut self) -> Result<(), DbError>;

    /// Commits the open transaction.
    async fn commit(&mut self) -> Result<(), DbError>;

    /// Rolls back the open transaction. Must succeed when none is open.
    async fn rollback(&mut self) -> Result<(), DbError>;

    /// Assigns one setting with the given scope.
    async fn set_variable(
        &mut self,
        name: &'static str,
        value: &str,
        scope: VariableScope,
    ) -> Result<(), DbError>;

    /// Restores one setting to its default. Never a blanket reset.
    async fn reset_variable(&mut self, name: &'static str) -> Result<(), DbError>;

    /// Whether transaction-local assignment is available on this connection.
    fn supports_transaction_scope(&self) -> bool {
        true
    }
}

/// Returns `true` for names like `app.current_user_id`.
#[must_use]
pub fn is_valid_setting_name(name: &str) -> bool {
    !name.is_empty()
        && name.contains('.')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.')
}
