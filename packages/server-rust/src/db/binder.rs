//! Translation of a [`TenantContext`] into the session variables read by RLS policies.

use serde::Deserialize;
use tablefence_core::{SecurityError, TenantContext};
use tracing::{debug, warn};

use super::connection::{SessionConnection, VariableScope};

pub const CURRENT_USER_ID: &str = "app.current_user_id";
pub const CURRENT_USER_ROLE: &str = "app.current_user_role";
pub const CURRENT_RESTAURANT_ID: &str = "app.current_restaurant_id";
pub const IS_PLATFORM_OWNER: &str = "app.is_platform_owner";

/// Every variable the binder may set, and therefore every variable it may reset.
pub const SESSION_VARIABLES: [&str; 4] = [
    CURRENT_USER_ID,
    CURRENT_USER_ROLE,
    CURRENT_RESTAURANT_ID,
    IS_PLATFORM_OWNER,
];

/// How the binder scopes its assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScoping {
    /// Transaction-local assignment; nothing to undo at transaction end.
    #[default]
    TransactionLocal,
    /// Connection-level assignment, reset variable by variable at transaction end.
    ConnectionOnly,
}

/// Values written for one context.
///
/// The restaurant id is the empty string when the context has none; custom
/// settings cannot hold SQL NULL, and the policies read it through
/// `NULLIF(current_setting('app.current_restaurant_id', true), '')`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionVariables {
    pub user_id: String,
    pub user_role: &'static str,
    pub restaurant_id: String,
    pub is_platform_owner: &'static str,
}

impl SessionVariables {
    #[must_use]
    pub fn from_context(ctx: &TenantContext) -> Self {
        Self {
            user_id: ctx.user_id().as_str().to_string(),
            user_role: ctx.user_role().as_str(),
            restaurant_id: ctx
                .restaurant_id()
                .map(|id| id.as_str().to_string())
                .unwrap_or_default(),
            is_platform_owner: if ctx.is_platform_owner() { "true" } else { "false" },
        }
    }

    /// `(name, value)` pairs in assignment order.
    #[must_use]
    pub fn pairs(&self) -> [(&'static str, &str); 4] {
        [
            (CURRENT_USER_ID, self.user_id.as_str()),
            (CURRENT_USER_ROLE, self.user_role),
            (CURRENT_RESTAURANT_ID, self.restaurant_id.as_str()),
            (IS_PLATFORM_OWNER, self.is_platform_owner),
        ]
    }
}

/// Record of what a successful [`SessionVariableBinder::bind`] assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    pub scope: VariableScope,
    pub variables: Vec<&'static str>,
}

impl SessionBinding {
    /// Variables that still need an explicit reset once the transaction ends.
    #[must_use]
    pub fn needs_reset(&self) -> &[&'static str] {
        match self.scope {
            VariableScope::Transaction => &[],
            VariableScope::Session => &self.variables,
        }
    }
}

/// Writes and, where needed, individually resets the tenant session variables.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionVariableBinder {
    scoping: VariableScoping,
}

impl SessionVariableBinder {
    #[must_use]
    pub fn new(scoping: VariableScoping) -> Self {
        Self { scoping }
    }

    #[must_use]
    pub fn scoping(&self) -> VariableScoping {
        self.scoping
    }

    /// The scope the binder will use on `conn`.
    pub fn scope_for<C: SessionConnection + ?Sized>(&self, conn: &C) -> VariableScope {
        match self.scoping {
            VariableScoping::TransactionLocal if conn.supports_transaction_scope() => {
                VariableScope::Transaction
            }
            _ => VariableScope::Session,
        }
    }

    /// Assigns all four variables for `ctx` on `conn`, inside an open transaction.
    ///
    /// # Errors
    ///
    /// Returns `SecurityError::ServiceUnavailable` if any assignment fails. The
    /// caller must roll the transaction back; with session scope, the
    /// variables written so far are reset before returning.
    pub async fn bind<C: SessionConnection + ?Sized>(
        &self,
        conn: &mut C,
        ctx: &TenantContext,
    ) -> Result<SessionBinding, SecurityError> {
        let scope = self.scope_for(conn);
        if scope == VariableScope::Session && self.scoping == VariableScoping::TransactionLocal {
            warn!("connection lacks transaction-local settings; falling back to itemized reset");
        }

        let values = SessionVariables::from_context(ctx);
        let mut written = Vec::with_capacity(SESSION_VARIABLES.len());
        for (name, value) in values.pairs() {
            if let Err(err) = conn.set_variable(name, value, scope).await {
                warn!(variable = name, error = %err, "session variable assignment failed");
                if scope == VariableScope::Session {
                    let partial = SessionBinding {
                        scope,
                        variables: written,
                    };
                    // The pool still records these as residue if the reset fails.
                    if let Err(reset_err) = self.release(conn, &partial).await {
                        warn!(
                            variables = partial.variables.len(),
                            error = %reset_err,
                            "reset after failed binding did not complete"
                        );
                    }
                }
                return Err(SecurityError::unavailable(format!(
                    "failed to bind {name}: {err}"
                )));
            }
            written.push(name);
        }

        debug!(
            user_id = %ctx.user_id(),
            platform_owner = ctx.is_platform_owner(),
            ?scope,
            "session variables bound"
        );
        Ok(SessionBinding {
            scope,
            variables: written,
        })
    }

    /// Undoes `binding` after the transaction ended.
    ///
    /// A no-op for transaction scope. For session scope each variable is
    /// reset on its own; all are attempted even if one fails.
    ///
    /// # Errors
    ///
    /// Returns the first reset failure as `SecurityError::ServiceUnavailable`.
    pub async fn release<C: SessionConnection + ?Sized>(
        &self,
        conn: &mut C,
        binding: &SessionBinding,
    ) -> Result<(), SecurityError> {
        reset_each(conn, binding.needs_reset()).await
    }
}

/// Resets each named variable individually, attempting all of them.
pub(crate) async fn reset_each<C: SessionConnection + ?Sized>(
    conn: &mut C,
    names: &[&'static str],
) -> Result<(), SecurityError> {
    let mut first_err = None;
    for &name in names {
        if let Err(err) = conn.reset_variable(name).await {
            warn!(variable = name, error = %err, "session variable reset failed");
            first_err.get_or_insert(err);
        }
    }
    match first_err {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use tablefence_core::{PlatformOwnerPolicy, Principal, RestaurantId, UserId, UserRole};

    use super::*;
    use crate::db::memory::MemoryDatabase;

    fn ctx(role: UserRole, email: &str, restaurant: Option<&str>) -> TenantContext {
        let principal = Principal {
            user_id: UserId::new("u-7"),
            email: email.to_string(),
            role,
            restaurant_id: restaurant.map(RestaurantId::from),
        };
        TenantContext::from_principal(&principal, &PlatformOwnerPolicy::new(["root@p.test"]))
            .unwrap()
    }

    #[test]
    fn variables_for_tenant_user() {
        let vars = SessionVariables::from_context(&ctx(UserRole::Manager, "m@r.test", Some("r-a")));
        assert_eq!(
            vars.pairs(),
            [
                (CURRENT_USER_ID, "u-7"),
                (CURRENT_USER_ROLE, "manager"),
                (CURRENT_RESTAURANT_ID, "r-a"),
                (IS_PLATFORM_OWNER, "false"),
            ]
        );
    }

    #[test]
    fn platform_owner_without_target_gets_no_restaurant() {
        let vars = SessionVariables::from_context(&ctx(UserRole::PlatformOwner, "root@p.test", None));
        assert_eq!(vars.restaurant_id, "");
        assert_eq!(vars.is_platform_owner, "true");
    }

    #[tokio::test]
    async fn transaction_scope_is_undone_by_commit() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        let binder = SessionVariableBinder::default();

        conn.begin().await.unwrap();
        let binding = binder
            .bind(&mut conn, &ctx(UserRole::Employee, "e@r.test", Some("r-a")))
            .await
            .unwrap();
        assert_eq!(binding.scope, VariableScope::Transaction);
        assert!(binding.needs_reset().is_empty());
        assert_eq!(conn.current_setting(CURRENT_RESTAURANT_ID), Some("r-a"));

        conn.commit().await.unwrap();
        binder.release(&mut conn, &binding).await.unwrap();
        assert_eq!(conn.current_setting(CURRENT_RESTAURANT_ID), None);
    }

    #[tokio::test]
    async fn connection_scope_is_reset_item_by_item() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        conn.set_session_setting("search_path", "tenant_app");
        let binder = SessionVariableBinder::new(VariableScoping::ConnectionOnly);

        conn.begin().await.unwrap();
        let binding = binder
            .bind(&mut conn, &ctx(UserRole::Employee, "e@r.test", Some("r-a")))
            .await
            .unwrap();
        conn.commit().await.unwrap();
        assert_eq!(conn.current_setting(CURRENT_RESTAURANT_ID), Some("r-a"));

        binder.release(&mut conn, &binding).await.unwrap();
        for name in SESSION_VARIABLES {
            assert_eq!(conn.current_setting(name), None);
        }
        assert_eq!(conn.current_setting("search_path"), Some("tenant_app"));
        assert!(conn.statements().iter().all(|s| s != "RESET ALL"));
    }

    #[test]
    fn falls_back_to_session_scope_when_unsupported() {
        let db = MemoryDatabase::new();
        let conn = db.connect().without_transaction_scope();
        let binder = SessionVariableBinder::default();
        assert_eq!(binder.scope_for(&conn), VariableScope::Session);
    }

    #[tokio::test]
    async fn failed_assignment_is_surfaced_and_partial_state_reset() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect().without_transaction_scope();
        conn.fail_on_variable(CURRENT_RESTAURANT_ID);
        let binder = SessionVariableBinder::new(VariableScoping::ConnectionOnly);

        conn.begin().await.unwrap();
        let err = binder
            .bind(&mut conn, &ctx(UserRole::Employee, "e@r.test", Some("r-a")))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        conn.rollback().await.unwrap();
        assert_eq!(conn.current_setting(CURRENT_USER_ID), None);
    }

    #[tokio::test]
    async fn failed_partial_reset_keeps_the_assignment_error() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect().without_transaction_scope();
        conn.fail_on_variable(CURRENT_RESTAURANT_ID);
        let binder = SessionVariableBinder::new(VariableScoping::ConnectionOnly);

        // The injected failure aborts the transaction, so the resets fail too.
        conn.begin().await.unwrap();
        let err = binder
            .bind(&mut conn, &ctx(UserRole::Employee, "e@r.test", Some("r-a")))
            .await
            .unwrap_err();
        assert!(err.to_string().contains(CURRENT_RESTAURANT_ID), "{err}");
        assert!(conn
            .statements()
            .iter()
            .any(|stmt| stmt == &format!("RESET {CURRENT_USER_ID}")));
    }
}
