//! Narrowing of `sea-query` statements to the caller's restaurants.
//!
//! This is the application-side twin of the RLS policy: it makes queries
//! return the right rows even against a role that bypasses RLS, and keeps
//! query plans from scanning other tenants.

use sea_query::{
    Alias, ConditionalStatement, DeleteStatement, Expr, SelectStatement, SimpleExpr,
    UpdateStatement,
};
use tablefence_core::TenantContext;

use super::guard::AccessSet;

/// A statement that accepts an extra `WHERE` conjunct.
pub trait ScopeTarget {
    fn and_scope(&mut self, condition: SimpleExpr);
}

macro_rules! scope_target {
    ($($ty:ty),+) => {
        $(
            impl ScopeTarget for $ty {
                fn and_scope(&mut self, condition: SimpleExpr) {
                    self.and_where(condition);
                }
            }
        )+
    };
}

scope_target!(SelectStatement, UpdateStatement, DeleteStatement);

/// Appends `<column> IN (...)` for the caller's restaurants.
#[derive(Debug, Clone)]
pub struct QueryScopeFilter {
    table: Option<String>,
    column: String,
}

impl Default for QueryScopeFilter {
    fn default() -> Self {
        Self::new("restaurant_id")
    }
}

impl QueryScopeFilter {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            table: None,
            column: column.into(),
        }
    }

    /// Qualifies the column with `table`, for joins.
    #[must_use]
    pub fn qualified(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Narrows `query` to the context's own restaurant.
    ///
    /// Platform owners are left unfiltered. A context with no restaurant gets
    /// a predicate that matches nothing.
    pub fn apply<'q, Q: ScopeTarget>(&self, query: &'q mut Q, ctx: &TenantContext) -> &'q mut Q {
        if ctx.is_platform_owner() {
            return query;
        }
        let values: Vec<String> = ctx
            .restaurant_id()
            .map(|id| id.as_str().to_string())
            .into_iter()
            .collect();
        query.and_scope(self.condition(values));
        query
    }

    /// Narrows `query` to a resolved access set, including explicit grants.
    ///
    /// Use with [`TenantAccessGuard::accessible_restaurants`](super::TenantAccessGuard::accessible_restaurants).
    pub fn apply_access<'q, Q: ScopeTarget>(
        &self,
        query: &'q mut Q,
        access: &AccessSet,
    ) -> &'q mut Q {
        match access {
            AccessSet::All => query,
            AccessSet::Only(set) => {
                let values = set.iter().map(|id| id.as_str().to_string()).collect();
                query.and_scope(self.condition(values));
                query
            }
        }
    }

    fn condition(&self, values: Vec<String>) -> SimpleExpr {
        if values.is_empty() {
            return Expr::value(false);
        }
        let column = Alias::new(self.column.as_str());
        let expr = match &self.table {
            Some(table) => Expr::col((Alias::new(table.as_str()), column)),
            None => Expr::col(column),
        };
        expr.is_in(values)
    }
}
