//! [`SessionConnection`] for a raw `sqlx` Postgres connection.
//!
//! Connections are opened individually and handed to [`TenantPool`], which
//! replaces `sqlx::PgPool` for tenant traffic: `sqlx`'s pool has no async
//! checkout hook that can observe a dropped transaction's session state.

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use tablefence_core::SecurityError;
use tracing::info;

use super::binder::SessionVariableBinder;
use super::connection::{is_valid_setting_name, DbError, SessionConnection, VariableScope};
use super::pool::TenantPool;

fn map_sqlx(err: &sqlx::Error) -> DbError {
    match err {
        sqlx::Error::Database(db) => DbError::Statement(db.message().to_string()),
        other => DbError::Connection(other.to_string()),
    }
}

async fn execute(conn: &mut PgConnection, sql: &str) -> Result<(), DbError> {
    sqlx::query(sql)
        .execute(&mut *conn)
        .await
        .map(|_| ())
        .map_err(|e| map_sqlx(&e))
}

#[async_trait]
impl SessionConnection for PgConnection {
    async fn begin(&mut self) -> Result<(), DbError> {
        execute(self, "BEGIN").await
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        execute(self, "COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        // Outside a transaction Postgres only warns, so this is safe to repeat.
        execute(self, "ROLLBACK").await
    }

    async fn set_variable(
        &mut self,
        name: &'static str,
        value: &str,
        scope: VariableScope,
    ) -> Result<(), DbError> {
        if !is_valid_setting_name(name) {
            return Err(DbError::InvalidSetting(name.to_string()));
        }
        sqlx::query("SELECT set_config($1, $2, $3)")
            .bind(name)
            .bind(value)
            .bind(scope == VariableScope::Transaction)
            .execute(&mut *self)
            .await
            .map(|_| ())
            .map_err(|e| map_sqlx(&e))
    }

    async fn reset_variable(&mut self, name: &'static str) -> Result<(), DbError> {
        // RESET takes an identifier, not a parameter; the name check keeps it
        // from being an injection point.
        if !is_valid_setting_name(name) {
            return Err(DbError::InvalidSetting(name.to_string()));
        }
        execute(self, &format!("RESET {name}")).await
    }
}

/// Opens `size` connections to `url` and wraps them in a [`TenantPool`].
///
/// # Errors
///
/// Returns `ServiceUnavailable` if any connection cannot be opened.
pub async fn connect_pool(
    url: &str,
    size: usize,
    binder: SessionVariableBinder,
) -> Result<TenantPool<PgConnection>, SecurityError> {
    let mut connections = Vec::with_capacity(size);
    for _ in 0..size {
        let conn = PgConnection::connect(url)
            .await
            .map_err(|e| SecurityError::from(map_sqlx(&e)))?;
        connections.push(conn);
    }
    info!(size, scoping = ?binder.scoping(), "postgres tenant pool connected");
    Ok(TenantPool::with_binder(connections, binder))
}
