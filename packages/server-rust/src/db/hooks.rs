//! Pool lifecycle callbacks that keep tenant bindings from outliving their transaction.

use async_trait::async_trait;
use tablefence_core::SecurityError;
use tracing::{debug, warn};

use super::binder::{reset_each, SessionBinding, SessionVariableBinder, SESSION_VARIABLES};
use super::connection::{SessionConnection, VariableScope};
use crate::context::ContextCarrier;
use crate::db::pool::TenantRequirement;

/// State a connection may carry back into the pool.
///
/// A transaction that finishes through `commit()`/`rollback()` leaves no
/// residue. One that is dropped mid-flight (panic, cancelled future) leaves
/// an open transaction and possibly session-scoped variables, which the
/// checkout hook must clear before the connection is handed out again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Residue {
    pub open_transaction: bool,
    pub variables: Vec<&'static str>,
}

impl Residue {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.open_transaction && self.variables.is_empty()
    }
}

/// Callbacks fired by [`TenantPool`](super::TenantPool).
#[async_trait]
pub trait ConnectionLifecycleHooks<C: SessionConnection>: Send + Sync {
    /// A pooled connection is about to be handed to a new transaction.
    ///
    /// Must leave the connection with no open transaction and none of the
    /// tenant variables set, or fail.
    async fn on_checkout(&self, conn: &mut C, residue: &Residue) -> Result<(), SecurityError>;

    /// A connection is going back to the pool. Runs synchronously in `Drop`.
    fn on_checkin(&self, conn: &C, residue: &Residue);

    /// A transaction was opened on `conn`; bind the operation's tenant.
    async fn on_transaction_begin(
        &self,
        conn: &mut C,
        carrier: &ContextCarrier,
        requirement: TenantRequirement,
    ) -> Result<Option<SessionBinding>, SecurityError>;

    /// The transaction committed or rolled back; undo anything still bound.
    async fn on_transaction_end(
        &self,
        conn: &mut C,
        binding: Option<&SessionBinding>,
    ) -> Result<(), SecurityError>;
}

/// Default hooks: bind through a [`SessionVariableBinder`] and scrub residue on checkout.
#[derive(Debug, Clone, Copy, Default)]
pub struct TenantSessionHooks {
    binder: SessionVariableBinder,
}

impl TenantSessionHooks {
    #[must_use]
    pub fn new(binder: SessionVariableBinder) -> Self {
        Self { binder }
    }

    #[must_use]
    pub fn binder(&self) -> &SessionVariableBinder {
        &self.binder
    }
}

#[async_trait]
impl<C: SessionConnection> ConnectionLifecycleHooks<C> for TenantSessionHooks {
    async fn on_checkout(&self, conn: &mut C, residue: &Residue) -> Result<(), SecurityError> {
        if residue.is_clean() {
            return Ok(());
        }
        warn!(
            open_transaction = residue.open_transaction,
            variables = residue.variables.len(),
            "scrubbing connection returned without a clean finish"
        );
        metrics::counter!("tablefence_connection_scrubs_total").increment(1);
        if residue.open_transaction {
            conn.rollback().await?;
        }
        reset_each(conn, &residue.variables).await
    }

    fn on_checkin(&self, _conn: &C, residue: &Residue) {
        if residue.is_clean() {
            debug!("connection checked in clean");
        } else {
            warn!(
                open_transaction = residue.open_transaction,
                variables = residue.variables.len(),
                "connection checked in with residue; will be scrubbed on next checkout"
            );
        }
    }

    async fn on_transaction_begin(
        &self,
        conn: &mut C,
        carrier: &ContextCarrier,
        requirement: TenantRequirement,
    ) -> Result<Option<SessionBinding>, SecurityError> {
        match (carrier.current(), requirement) {
            (Some(ctx), _) => self.binder.bind(conn, &ctx).await.map(Some),
            (None, TenantRequirement::Unscoped) => {
                debug!(operation_id = %carrier.operation_id(), "unscoped transaction");
                Ok(None)
            }
            (None, TenantRequirement::Required) => Err(SecurityError::authorization(format!(
                "operation {} opened a tenant transaction without a bound context",
                carrier.operation_id()
            ))),
        }
    }

    async fn on_transaction_end(
        &self,
        conn: &mut C,
        binding: Option<&SessionBinding>,
    ) -> Result<(), SecurityError> {
        match binding {
            Some(binding) => self.binder.release(conn, binding).await,
            None => Ok(()),
        }
    }
}

/// Residue to assume while a transaction is being bound with `scope`.
pub(crate) fn in_flight_residue(scope: VariableScope) -> Residue {
    Residue {
        open_transaction: true,
        variables: match scope {
            VariableScope::Transaction => Vec::new(),
            VariableScope::Session => SESSION_VARIABLES.to_vec(),
        },
    }
}
