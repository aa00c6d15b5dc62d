//! Application-level tenant authorization, independent of row-level security.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use tablefence_core::{RestaurantId, SecurityError, TenantContext};
use tracing::debug;

use super::audit::{AccessOperation, AuditOutcome, AuditRecord};
use super::sanitize::ResponseSanitizer;
use crate::traits::{AuditSink, GrantStore};

/// Restaurants a context may act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessSet {
    /// Platform owner: every restaurant.
    All,
    /// The legacy binding plus explicit grants. May be empty.
    Only(BTreeSet<RestaurantId>),
}

impl AccessSet {
    #[must_use]
    pub fn contains(&self, restaurant: &RestaurantId) -> bool {
        match self {
            Self::All => true,
            Self::Only(set) => set.contains(restaurant),
        }
    }
}

/// Second authorization layer above RLS, for code that branches on tenant
/// ownership before it ever reaches the database.
///
/// Grants are read from the [`GrantStore`] on every call and never cached.
pub struct TenantAccessGuard {
    grants: Arc<dyn GrantStore>,
    audit: Arc<dyn AuditSink>,
    sanitizer: ResponseSanitizer,
}

impl TenantAccessGuard {
    #[must_use]
    pub fn new(grants: Arc<dyn GrantStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            grants,
            audit,
            sanitizer: ResponseSanitizer::default(),
        }
    }

    /// Replaces the default platform-only key set.
    #[must_use]
    pub fn with_sanitizer(mut self, sanitizer: ResponseSanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// Checks that `ctx` may perform `operation` on data owned by `target`.
    ///
    /// Platform owners are always allowed and always audited. Everyone else
    /// needs `target` to be their own restaurant or an explicit grant.
    ///
    /// Async because a caller acting outside their own restaurant triggers a
    /// [`GrantStore`] lookup, which may await I/O. Own-restaurant and
    /// platform-owner checks complete without suspending.
    ///
    /// # Errors
    ///
    /// - `Authorization` when `target` is outside the caller's access set
    /// - `ServiceUnavailable` when the grant store cannot be read
    ///
    /// Both carry the same public message and are audited with the real reason.
    pub async fn validate(
        &self,
        ctx: &TenantContext,
        target: &RestaurantId,
        operation: AccessOperation,
        resource_type: Option<&str>,
    ) -> Result<(), SecurityError> {
        if ctx.is_platform_owner() {
            self.audit(
                ctx,
                target,
                operation,
                resource_type,
                AuditOutcome::PlatformOwnerBypass,
                "platform owner".to_string(),
            );
            return Ok(());
        }

        if ctx.restaurant_id() == Some(target) {
            return Ok(());
        }

        let granted = match self.grants.granted_restaurants(ctx.user_id()).await {
            Ok(granted) => granted,
            Err(err) => {
                let err = err.fail_closed();
                self.deny(ctx, target, operation, resource_type, format!("grant lookup failed: {err}"));
                return Err(err);
            }
        };

        if granted.contains(target) {
            debug!(
                user_id = %ctx.user_id(),
                target_restaurant = %target,
                %operation,
                "allowed by explicit grant"
            );
            return Ok(());
        }

        let reason = format!(
            "user {} has no access to restaurant {target}",
            ctx.user_id()
        );
        self.deny(ctx, target, operation, resource_type, reason.clone());
        Err(SecurityError::authorization(reason))
    }

    /// The restaurants `ctx` may act on right now.
    ///
    /// # Errors
    ///
    /// Returns `ServiceUnavailable` if the grant store cannot be read.
    pub async fn accessible_restaurants(
        &self,
        ctx: &TenantContext,
    ) -> Result<AccessSet, SecurityError> {
        if ctx.is_platform_owner() {
            return Ok(AccessSet::All);
        }
        let mut set = self
            .grants
            .granted_restaurants(ctx.user_id())
            .await
            .map_err(SecurityError::fail_closed)?;
        if let Some(own) = ctx.restaurant_id() {
            set.insert(own.clone());
        }
        Ok(AccessSet::Only(set))
    }

    /// Removes platform-only fields from `data` unless `ctx` is a platform owner.
    #[must_use]
    pub fn sanitize_response_data(&self, ctx: &TenantContext, mut data: Value) -> Value {
        if ctx.is_platform_owner() {
            return data;
        }
        let removed = self.sanitizer.sanitize(&mut data);
        if removed > 0 {
            debug!(user_id = %ctx.user_id(), removed, "platform-only fields redacted");
        }
        data
    }

    fn deny(
        &self,
        ctx: &TenantContext,
        target: &RestaurantId,
        operation: AccessOperation,
        resource_type: Option<&str>,
        reason: String,
    ) {
        metrics::counter!("tablefence_access_denied_total", "operation" => operation.as_str())
            .increment(1);
        self.audit(ctx, target, operation, resource_type, AuditOutcome::Denied, reason);
    }

    fn audit(
        &self,
        ctx: &TenantContext,
        target: &RestaurantId,
        operation: AccessOperation,
        resource_type: Option<&str>,
        outcome: AuditOutcome,
        reason: String,
    ) {
        self.audit.record(&AuditRecord {
            actor: ctx.user_id().clone(),
            role: ctx.user_role(),
            actor_restaurant: ctx.restaurant_id().cloned(),
            target_restaurant: target.clone(),
            operation,
            resource_type: resource_type.map(str::to_string),
            outcome,
            reason,
        });
    }
}
