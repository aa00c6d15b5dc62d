//! Application-level tenant access control.
//!
//! - [`TenantAccessGuard`]: per-call authorization, grant resolution, response redaction
//! - [`QueryScopeFilter`]: narrows `sea-query` statements to the caller's restaurants
//! - [`audit`]: audit records and sinks
//! - [`InMemoryGrantStore`]: `dashmap`-backed [`GrantStore`](crate::traits::GrantStore)

pub mod audit;
pub mod grants;
pub mod guard;
pub mod sanitize;
pub mod scope;

pub use audit::{AccessOperation, AuditOutcome, AuditRecord, RecordingAuditSink, TracingAuditSink};
pub use grants::InMemoryGrantStore;
pub use guard::{AccessSet, TenantAccessGuard};
pub use sanitize::{ResponseSanitizer, DEFAULT_PLATFORM_ONLY_KEYS};
pub use scope::{QueryScopeFilter, ScopeTarget};
