//! Tenant-scoped database sessions.
//!
//! - [`connection`]: the [`SessionConnection`] seam over a physical connection
//! - [`binder`]: [`SessionVariableBinder`], which writes the four `app.*` variables
//! - [`hooks`]: [`ConnectionLifecycleHooks`] fired by the pool on checkout/checkin
//! - [`pool`]: [`TenantPool`] and [`TenantTransaction`]
//! - [`memory`]: in-memory engine with row-level-security emulation
//! - `postgres` (feature `postgres`): `SessionConnection` for `sqlx::PgConnection`

pub mod binder;
pub mod connection;
pub mod hooks;
pub mod memory;
pub mod pool;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use binder::{
    SessionBinding, SessionVariableBinder, SessionVariables, VariableScoping, CURRENT_RESTAURANT_ID,
    CURRENT_USER_ID, CURRENT_USER_ROLE, IS_PLATFORM_OWNER, SESSION_VARIABLES,
};
pub use connection::{DbError, SessionConnection, VariableScope};
pub use hooks::{ConnectionLifecycleHooks, Residue, TenantSessionHooks};
pub use memory::{MemoryConnection, MemoryDatabase, MemoryRow};
pub use pool::{TenantPool, TenantRequirement, TenantTransaction};
