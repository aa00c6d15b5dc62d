//! Fixed-size connection pool that binds the operation's tenant to every transaction.
//!
//! Checkout order is LIFO, so a connection just released by one tenant is the
//! first one handed to the next; residue handling is exercised on every reuse
//! rather than only under load.

use std::sync::Arc;

use parking_lot::Mutex;
use tablefence_core::{SecurityError, TenantContext};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use super::binder::{SessionBinding, SessionVariableBinder};
use super::connection::{SessionConnection, VariableScope};
use super::hooks::{in_flight_residue, ConnectionLifecycleHooks, Residue, TenantSessionHooks};
use crate::context::ContextCarrier;

/// Whether a transaction may run without a bound tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantRequirement {
    /// A tenant context must be bound; absence is an authorization failure.
    Required,
    /// Health checks and similar statements that touch no tenant data.
    Unscoped,
}

struct Slot<C> {
    conn: C,
    residue: Residue,
}

struct PoolInner<C: SessionConnection> {
    idle: Mutex<Vec<Slot<C>>>,
    permits: Arc<Semaphore>,
    hooks: Arc<dyn ConnectionLifecycleHooks<C>>,
    size: usize,
}

/// Pool of physical connections whose transactions are always tenant-bound.
pub struct TenantPool<C: SessionConnection> {
    inner: Arc<PoolInner<C>>,
}

impl<C: SessionConnection> Clone for TenantPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: SessionConnection> TenantPool<C> {
    /// Creates a pool over already-opened connections.
    #[must_use]
    pub fn new(connections: Vec<C>, hooks: Arc<dyn ConnectionLifecycleHooks<C>>) -> Self {
        let size = connections.len();
        let idle = connections
            .into_iter()
            .map(|conn| Slot {
                conn,
                residue: Residue::default(),
            })
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(idle),
                permits: Arc::new(Semaphore::new(size)),
                hooks,
                size,
            }),
        }
    }

    /// Creates a pool using [`TenantSessionHooks`] around `binder`.
    #[must_use]
    pub fn with_binder(connections: Vec<C>, binder: SessionVariableBinder) -> Self {
        Self::new(connections, Arc::new(TenantSessionHooks::new(binder)))
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Connections currently idle in the pool.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Checks out a connection, opens a transaction, and binds the carrier's tenant.
    ///
    /// Waiting for a free connection observes the carrier's cancellation and
    /// deadline.
    ///
    /// # Errors
    ///
    /// - `Authorization` when `requirement` is `Required` and nothing is bound
    /// - `ServiceUnavailable` when checkout cleanup, `BEGIN`, or binding fails;
    ///   the transaction is rolled back first
    /// - `Cancelled` when the operation is cancelled while waiting
    pub async fn begin(
        &self,
        carrier: &ContextCarrier,
        requirement: TenantRequirement,
    ) -> Result<TenantTransaction<C>, SecurityError> {
        if requirement == TenantRequirement::Required && carrier.current().is_none() {
            return Err(SecurityError::authorization(format!(
                "operation {} requested a tenant transaction without a bound context",
                carrier.operation_id()
            )));
        }

        let permit = carrier
            .run(Arc::clone(&self.inner.permits).acquire_owned())
            .await?
            .map_err(|_closed| SecurityError::unavailable("connection pool closed"))?;
        let slot = self
            .inner
            .idle
            .lock()
            .pop()
            .ok_or_else(|| SecurityError::unavailable("connection pool exhausted"))?;

        let mut lease = Lease {
            pool: Arc::clone(&self.inner),
            slot: Some(slot),
            _permit: permit,
        };
        let hooks = Arc::clone(&self.inner.hooks);

        {
            let slot = lease.slot_mut();
            let residue = slot.residue.clone();
            hooks.on_checkout(&mut slot.conn, &residue).await?;
            slot.residue = Residue::default();
        }

        {
            let slot = lease.slot_mut();
            // Marked before BEGIN so a cancellation at any later await point
            // leaves the slot flagged for scrubbing. The pool does not know the
            // hooks' scoping, so assume the widest.
            slot.residue = in_flight_residue(VariableScope::Session);
            slot.conn.begin().await?;
        }

        let slot = lease.slot_mut();
        let binding = match hooks
            .on_transaction_begin(&mut slot.conn, carrier, requirement)
            .await
        {
            Ok(binding) => binding,
            Err(err) => {
                warn!(
                    operation_id = %carrier.operation_id(),
                    error = %err,
                    "tenant binding failed; rolling back"
                );
                if slot.conn.rollback().await.is_ok() {
                    slot.residue.open_transaction = false;
                }
                return Err(err);
            }
        };
        if let Some(binding) = &binding {
            slot.residue.variables = binding.needs_reset().to_vec();
        } else {
            slot.residue.variables.clear();
        }

        Ok(TenantTransaction {
            lease,
            binding,
            context: carrier.current(),
        })
    }
}

/// A connection checked out of the pool. Returns it on drop.
struct Lease<C: SessionConnection> {
    pool: Arc<PoolInner<C>>,
    slot: Option<Slot<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: SessionConnection> Lease<C> {
    fn slot_mut(&mut self) -> &mut Slot<C> {
        // Only `Drop` takes the slot.
        self.slot.as_mut().unwrap_or_else(|| unreachable!("lease used after release"))
    }
}

impl<C: SessionConnection> Drop for Lease<C> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.hooks.on_checkin(&slot.conn, &slot.residue);
            self.pool.idle.lock().push(slot);
        }
        // `_permit` is released after the slot is back in the idle list.
    }
}

/// An open, tenant-bound transaction on a pooled connection.
///
/// Finish it with [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// Dropping it unfinished returns the connection with residue that the next
/// checkout rolls back and resets.
pub struct TenantTransaction<C: SessionConnection> {
    lease: Lease<C>,
    binding: Option<SessionBinding>,
    context: Option<Arc<TenantContext>>,
}

impl<C: SessionConnection> TenantTransaction<C> {
    /// The physical connection, for issuing statements.
    pub fn connection(&mut self) -> &mut C {
        &mut self.lease.slot_mut().conn
    }

    /// The context this transaction is bound to, `None` for unscoped transactions.
    #[must_use]
    pub fn context(&self) -> Option<&TenantContext> {
        self.context.as_deref()
    }

    #[must_use]
    pub fn binding(&self) -> Option<&SessionBinding> {
        self.binding.as_ref()
    }

    /// Commits and releases any connection-scoped variables.
    ///
    /// # Errors
    ///
    /// Returns `ServiceUnavailable` if the commit or the itemized reset fails;
    /// the connection is then scrubbed on its next checkout.
    pub async fn commit(self) -> Result<(), SecurityError> {
        self.finish(true).await
    }

    /// Rolls back and releases any connection-scoped variables.
    ///
    /// # Errors
    ///
    /// Returns `ServiceUnavailable` if the rollback or the itemized reset fails.
    pub async fn rollback(self) -> Result<(), SecurityError> {
        self.finish(false).await
    }

    async fn finish(mut self, commit: bool) -> Result<(), SecurityError> {
        let hooks = Arc::clone(&self.lease.pool.hooks);
        let slot = self.lease.slot_mut();

        let ended = if commit {
            slot.conn.commit().await
        } else {
            slot.conn.rollback().await
        };
        if let Err(err) = ended {
            // A failed COMMIT leaves the session in an unknown state; keep the residue.
            return Err(err.into());
        }
        slot.residue.open_transaction = false;

        hooks
            .on_transaction_end(&mut slot.conn, self.binding.as_ref())
            .await?;
        slot.residue.variables.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tablefence_core::{PlatformOwnerPolicy, Principal, RestaurantId, UserId, UserRole};

    use super::*;
    use crate::db::binder::{VariableScoping, CURRENT_RESTAURANT_ID, CURRENT_USER_ID};
    use crate::db::memory::{MemoryConnection, MemoryDatabase};

    fn ctx(user: &str, restaurant: &str) -> TenantContext {
        let principal = Principal {
            user_id: UserId::new(user),
            email: format!("{user}@r.test"),
            role: UserRole::Employee,
            restaurant_id: Some(RestaurantId::new(restaurant)),
        };
        TenantContext::from_principal(&principal, &PlatformOwnerPolicy::default()).unwrap()
    }

    fn pool(size: usize, scoping: VariableScoping) -> TenantPool<MemoryConnection> {
        let db = MemoryDatabase::new();
        TenantPool::with_binder(db.connect_many(size), SessionVariableBinder::new(scoping))
    }

    #[tokio::test]
    async fn begin_binds_current_context() {
        let pool = pool(1, VariableScoping::TransactionLocal);
        let carrier = ContextCarrier::new();
        let _scope = carrier.bind(ctx("u1", "r-a")).unwrap();

        let mut tx = pool.begin(&carrier, TenantRequirement::Required).await.unwrap();
        assert_eq!(tx.connection().current_setting(CURRENT_RESTAURANT_ID), Some("r-a"));
        assert_eq!(tx.context().unwrap().user_id().as_str(), "u1");
        assert_eq!(pool.idle_count(), 0);
        tx.commit().await.unwrap();
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn required_without_context_is_denied_and_connection_untouched() {
        let pool = pool(1, VariableScoping::TransactionLocal);
        let carrier = ContextCarrier::new();
        let err = pool
            .begin(&carrier, TenantRequirement::Required)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), "authorization");
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn unscoped_transaction_runs_without_variables() {
        let pool = pool(1, VariableScoping::TransactionLocal);
        let carrier = ContextCarrier::new();
        let mut tx = pool.begin(&carrier, TenantRequirement::Unscoped).await.unwrap();
        assert!(tx.binding().is_none());
        assert!(tx.context().is_none());
        assert_eq!(tx.connection().current_setting(CURRENT_USER_ID), None);
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn connection_scope_is_reset_after_commit() {
        let pool = pool(1, VariableScoping::ConnectionOnly);
        let first = ContextCarrier::new();
        let _scope = first.bind(ctx("u1", "r-a")).unwrap();
        let tx = pool.begin(&first, TenantRequirement::Required).await.unwrap();
        tx.commit().await.unwrap();

        let health = ContextCarrier::new();
        let mut tx = pool.begin(&health, TenantRequirement::Unscoped).await.unwrap();
        assert_eq!(tx.connection().current_setting(CURRENT_RESTAURANT_ID), None);
        assert_eq!(tx.connection().current_setting(CURRENT_USER_ID), None);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_transaction_is_scrubbed_before_reuse() {
        let pool = pool(1, VariableScoping::ConnectionOnly);
        let first = ContextCarrier::new();
        let _scope = first.bind(ctx("u1", "r-a")).unwrap();
        let tx = pool.begin(&first, TenantRequirement::Required).await.unwrap();
        drop(tx);

        let next = ContextCarrier::new();
        let mut tx = pool.begin(&next, TenantRequirement::Unscoped).await.unwrap();
        assert_eq!(tx.connection().current_setting(CURRENT_RESTAURANT_ID), None);
        assert!(tx
            .connection()
            .statements()
            .iter()
            .any(|s| s == "ROLLBACK"));
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn failed_binding_rolls_back_and_returns_connection() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        conn.fail_on_variable(CURRENT_RESTAURANT_ID);
        let pool = TenantPool::with_binder(vec![conn], SessionVariableBinder::default());

        let carrier = ContextCarrier::new();
        let _scope = carrier.bind(ctx("u1", "r-a")).unwrap();
        let err = pool
            .begin(&carrier, TenantRequirement::Required)
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable());
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_wait_for_connection_returns_cancelled() {
        let pool = pool(1, VariableScoping::TransactionLocal);
        let holder = ContextCarrier::new();
        let _held = pool.begin(&holder, TenantRequirement::Unscoped).await.unwrap();

        let waiter = ContextCarrier::new();
        waiter.cancellation().cancel();
        let err = pool
            .begin(&waiter, TenantRequirement::Unscoped)
            .await
            .err()
            .unwrap();
        assert_eq!(err, SecurityError::Cancelled);
    }
}
