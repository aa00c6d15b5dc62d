//! Request-scoped carrier binding one [`TenantContext`] to one logical operation.
//!
//! The carrier is created by the transport layer (or job runner) for each
//! inbound operation and passed down the call chain by reference or cheap
//! clone. It is also the operation's cancellation and deadline channel, so
//! anything that can observe cancellation can also observe the tenant, and
//! nothing outside the operation can. There is no thread-local or global
//! fallback: code that receives no carrier has no tenant.

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tablefence_core::{SecurityError, TenantContext};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct CarrierInner {
    operation_id: Uuid,
    slot: RwLock<Option<Arc<TenantContext>>>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

/// Carries the tenant binding, cancellation token, and deadline of one operation.
///
/// Clones share the same operation: a binding made through one clone is
/// visible through all of them and released for all of them.
#[derive(Clone)]
pub struct ContextCarrier {
    inner: Arc<CarrierInner>,
}

impl ContextCarrier {
    /// Creates a carrier for a new operation with its own cancellation token
    /// and no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new(), None)
    }

    /// Creates a carrier tied to an existing cancellation token and optional deadline.
    #[must_use]
    pub fn with_cancellation(cancel: CancellationToken, deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(CarrierInner {
                operation_id: Uuid::new_v4(),
                slot: RwLock::new(None),
                cancel,
                deadline,
            }),
        }
    }

    /// Identifier of the operation, for log correlation.
    #[must_use]
    pub fn operation_id(&self) -> Uuid {
        self.inner.operation_id
    }

    /// Binds `ctx` to this operation until the returned handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns `SecurityError::Authorization` if a context is already bound;
    /// an operation carries exactly one acting principal.
    pub fn bind(&self, ctx: TenantContext) -> Result<ScopeHandle, SecurityError> {
        let mut slot = self.inner.slot.write();
        if let Some(existing) = slot.as_ref() {
            return Err(SecurityError::authorization(format!(
                "operation {} already bound to user {}; refusing rebind to user {}",
                self.inner.operation_id,
                existing.user_id(),
                ctx.user_id()
            )));
        }

        let ctx = Arc::new(ctx);
        *slot = Some(Arc::clone(&ctx));
        tracing::debug!(
            operation_id = %self.inner.operation_id,
            user_id = %ctx.user_id(),
            "tenant context bound"
        );

        Ok(ScopeHandle {
            inner: Arc::clone(&self.inner),
            ctx,
        })
    }

    /// The context bound to this operation, if any.
    #[must_use]
    pub fn current(&self) -> Option<Arc<TenantContext>> {
        self.inner.slot.read().clone()
    }

    /// The bound context, treating absence as an authorization failure.
    ///
    /// # Errors
    ///
    /// Returns `SecurityError::Authorization` when nothing is bound.
    pub fn require(&self) -> Result<Arc<TenantContext>, SecurityError> {
        self.current().ok_or_else(|| {
            SecurityError::authorization(format!(
                "operation {} has no tenant context",
                self.inner.operation_id
            ))
        })
    }

    /// Cancellation token of this operation.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
            || self
                .inner
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Drives `fut` to completion unless the operation is cancelled or its
    /// deadline passes first, in which case `fut` is dropped.
    ///
    /// # Errors
    ///
    /// Returns `SecurityError::Cancelled` on cancellation or deadline expiry.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, SecurityError>
    where
        F: Future,
    {
        let cancelled = self.inner.cancel.cancelled();
        match self.inner.deadline {
            Some(deadline) => tokio::select! {
                biased;
                () = cancelled => Err(SecurityError::Cancelled),
                out = tokio::time::timeout_at(deadline, fut) => {
                    out.map_err(|_elapsed| SecurityError::Cancelled)
                }
            },
            None => tokio::select! {
                biased;
                () = cancelled => Err(SecurityError::Cancelled),
                out = fut => Ok(out),
            },
        }
    }
}

impl Default for ContextCarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContextCarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextCarrier")
            .field("operation_id", &self.inner.operation_id)
            .field("bound", &self.inner.slot.read().is_some())
            .field("cancelled", &self.inner.cancel.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

/// RAII guard for a tenant binding.
///
/// Dropping the handle clears the binding, including during unwinding, so a
/// failed or panicking operation cannot leave its context behind.
#[must_use = "dropping the handle immediately unbinds the tenant context"]
pub struct ScopeHandle {
    inner: Arc<CarrierInner>,
    ctx: Arc<TenantContext>,
}

impl ScopeHandle {
    /// The context this handle keeps bound.
    #[must_use]
    pub fn context(&self) -> &TenantContext {
        &self.ctx
    }
}

impl std::fmt::Debug for ScopeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeHandle")
            .field("operation_id", &self.inner.operation_id)
            .field("user_id", self.ctx.user_id())
            .finish()
    }
}

impl Drop for ScopeHandle {
    fn drop(&mut self) {
        let mut slot = self.inner.slot.write();
        if slot.as_ref().is_some_and(|bound| Arc::ptr_eq(bound, &self.ctx)) {
            *slot = None;
        }
    }
}
