//! In-memory database engine for tests and local development.
//!
//! [`MemoryDatabase`] holds one table of tenant rows guarded by the same
//! predicate the installed RLS policies use: a row is visible (and writable)
//! when its restaurant matches `app.current_restaurant_id` or
//! `app.is_platform_owner` is `'true'`. [`MemoryConnection`] reproduces the
//! setting semantics of a pooled Postgres connection:
//!
//! - transaction-local assignments vanish at commit or rollback;
//! - session assignments made inside a transaction become permanent on
//!   commit and are reverted on rollback;
//! - committed session assignments survive into the next transaction on the
//!   same connection until individually reset;
//! - a failed statement aborts the transaction until it is rolled back.
//!
//! Each statement yields to the scheduler so concurrent tests interleave.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::binder::{CURRENT_RESTAURANT_ID, IS_PLATFORM_OWNER};
use super::connection::{is_valid_setting_name, DbError, SessionConnection, VariableScope};

/// One tenant-owned row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRow {
    pub restaurant_id: String,
    pub body: String,
}

/// Shared storage behind a set of [`MemoryConnection`]s.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    rows: Mutex<Vec<MemoryRow>>,
    next_connection_id: AtomicUsize,
}

impl MemoryDatabase {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Opens one physical connection.
    #[must_use]
    pub fn connect(self: &Arc<Self>) -> MemoryConnection {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        MemoryConnection {
            id,
            db: Arc::clone(self),
            session: HashMap::new(),
            pending_session: HashMap::new(),
            local: HashMap::new(),
            in_transaction: false,
            aborted: false,
            pending_rows: Vec::new(),
            transaction_scope: true,
            fail_on: None,
            statements: Vec::new(),
        }
    }

    /// Opens `count` connections, e.g. to seed a pool.
    #[must_use]
    pub fn connect_many(self: &Arc<Self>, count: usize) -> Vec<MemoryConnection> {
        (0..count).map(|_| self.connect()).collect()
    }

    /// All committed rows, bypassing row-level security.
    #[must_use]
    pub fn all_rows(&self) -> Vec<MemoryRow> {
        self.rows.lock().clone()
    }
}

/// One physical connection to a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: usize,
    db: Arc<MemoryDatabase>,
    session: HashMap<String, String>,
    /// Session assignments made in the open transaction: `None` marks a reset.
    pending_session: HashMap<String, Option<String>>,
    local: HashMap<String, String>,
    in_transaction: bool,
    aborted: bool,
    pending_rows: Vec<MemoryRow>,
    transaction_scope: bool,
    fail_on: Option<String>,
    statements: Vec<String>,
}

impl MemoryConnection {
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Emulates a driver without transaction-local settings.
    #[must_use]
    pub fn without_transaction_scope(mut self) -> Self {
        self.transaction_scope = false;
        self
    }

    /// Makes every assignment of `name` fail, aborting the transaction.
    pub fn fail_on_variable(&mut self, name: &str) {
        self.fail_on = Some(name.to_string());
    }

    /// Clears an injected failure.
    pub fn clear_failures(&mut self) {
        self.fail_on = None;
    }

    /// Sets unrelated session state, as another layer would (search path, timeouts).
    pub fn set_session_setting(&mut self, name: &str, value: &str) {
        self.session.insert(name.to_string(), value.to_string());
    }

    /// Effective value of a setting, like `current_setting(name, true)`.
    ///
    /// Empty values read as `None`.
    #[must_use]
    pub fn current_setting(&self, name: &str) -> Option<&str> {
        let value = if let Some(v) = self.local.get(name) {
            Some(v.as_str())
        } else if let Some(pending) = self.pending_session.get(name) {
            pending.as_deref()
        } else {
            self.session.get(name).map(String::as_str)
        };
        value.filter(|v| !v.is_empty())
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Statements executed so far, in order.
    #[must_use]
    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    /// Inserts a row, subject to the RLS write check.
    ///
    /// # Errors
    ///
    /// Fails outside a transaction, in an aborted transaction, or when the
    /// row is not writable under the current settings.
    pub async fn insert(&mut self, restaurant_id: &str, body: &str) -> Result<(), DbError> {
        tokio::task::yield_now().await;
        self.log(format!("INSERT INTO tenant_rows VALUES ('{restaurant_id}', ..)"));
        self.check_usable()?;
        if !self.in_transaction {
            return Err(DbError::Statement("insert outside transaction".into()));
        }
        if !self.row_visible(restaurant_id) {
            self.aborted = true;
            return Err(DbError::Statement(
                "new row violates row-level security policy".into(),
            ));
        }
        self.pending_rows.push(MemoryRow {
            restaurant_id: restaurant_id.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    /// Rows visible under the current settings, including this transaction's own writes.
    ///
    /// # Errors
    ///
    /// Fails in an aborted transaction.
    pub async fn select_visible(&mut self) -> Result<Vec<MemoryRow>, DbError> {
        tokio::task::yield_now().await;
        self.log("SELECT * FROM tenant_rows".to_string());
        self.check_usable()?;
        let committed = self.db.rows.lock().clone();
        Ok(committed
            .into_iter()
            .chain(self.pending_rows.iter().cloned())
            .filter(|row| self.row_visible(&row.restaurant_id))
            .collect())
    }

    fn row_visible(&self, restaurant_id: &str) -> bool {
        self.current_setting(IS_PLATFORM_OWNER) == Some("true")
            || self.current_setting(CURRENT_RESTAURANT_ID) == Some(restaurant_id)
    }

    fn check_usable(&self) -> Result<(), DbError> {
        if self.aborted {
            return Err(DbError::Statement(
                "current transaction is aborted, commands ignored until end of transaction block"
                    .into(),
            ));
        }
        Ok(())
    }

    fn log(&mut self, statement: String) {
        self.statements.push(statement);
    }

    fn end_transaction(&mut self, commit: bool) {
        if commit {
            for (name, value) in self.pending_session.drain() {
                match value {
                    Some(v) => {
                        self.session.insert(name, v);
                    }
                    None => {
                        self.session.remove(&name);
                    }
                }
            }
            self.db.rows.lock().append(&mut self.pending_rows);
        } else {
            self.pending_session.clear();
            self.pending_rows.clear();
        }
        self.local.clear();
        self.in_transaction = false;
        self.aborted = false;
    }
}

#[async_trait]
impl SessionConnection for MemoryConnection {
    async fn begin(&mut self) -> Result<(), DbError> {
        tokio::task::yield_now().await;
        self.log("BEGIN".to_string());
        if self.in_transaction {
            return Err(DbError::Statement("transaction already in progress".into()));
        }
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        tokio::task::yield_now().await;
        self.log("COMMIT".to_string());
        if !self.in_transaction {
            return Err(DbError::Statement("no transaction in progress".into()));
        }
        if self.aborted {
            self.end_transaction(false);
            return Err(DbError::Statement("transaction was aborted; rolled back".into()));
        }
        self.end_transaction(true);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        tokio::task::yield_now().await;
        self.log("ROLLBACK".to_string());
        self.end_transaction(false);
        Ok(())
    }

    async fn set_variable(
        &mut self,
        name: &'static str,
        value: &str,
        scope: VariableScope,
    ) -> Result<(), DbError> {
        tokio::task::yield_now().await;
        let is_local = scope == VariableScope::Transaction;
        self.log(format!("SELECT set_config('{name}', '{value}', {is_local})"));
        if !is_valid_setting_name(name) {
            return Err(DbError::InvalidSetting(name.to_string()));
        }
        self.check_usable()?;
        if self.fail_on.as_deref() == Some(name) {
            if self.in_transaction {
                self.aborted = true;
            }
            return Err(DbError::Connection(format!("injected failure on {name}")));
        }
        match scope {
            VariableScope::Transaction if !self.transaction_scope => Err(DbError::Statement(
                "transaction-local settings unsupported".into(),
            )),
            // Outside a transaction a local assignment only lasts for its own statement.
            VariableScope::Transaction if !self.in_transaction => Ok(()),
            VariableScope::Transaction => {
                self.local.insert(name.to_string(), value.to_string());
                Ok(())
            }
            VariableScope::Session if self.in_transaction => {
                self.pending_session
                    .insert(name.to_string(), Some(value.to_string()));
                Ok(())
            }
            VariableScope::Session => {
                self.session.insert(name.to_string(), value.to_string());
                Ok(())
            }
        }
    }

    async fn reset_variable(&mut self, name: &'static str) -> Result<(), DbError> {
        tokio::task::yield_now().await;
        self.log(format!("RESET {name}"));
        if !is_valid_setting_name(name) {
            return Err(DbError::InvalidSetting(name.to_string()));
        }
        self.check_usable()?;
        if self.in_transaction {
            self.local.remove(name);
            self.pending_session.insert(name.to_string(), None);
        } else {
            self.session.remove(name);
        }
        Ok(())
    }

    fn supports_transaction_scope(&self) -> bool {
        self.transaction_scope
    }
}
