//! Audit records for tenant access decisions.

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use tablefence_core::{RestaurantId, UserId, UserRole};
use tracing::{info, warn};

use crate::traits::AuditSink;

/// Kind of access being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessOperation {
    Read,
    Create,
    Update,
    Delete,
}

impl AccessOperation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for AccessOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Allowed through the platform-owner bypass.
    PlatformOwnerBypass,
    Denied,
}

/// One access decision worth keeping.
///
/// Ordinary same-tenant allows are not audited; platform-owner access and
/// every denial are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub actor: UserId,
    pub role: UserRole,
    pub actor_restaurant: Option<RestaurantId>,
    pub target_restaurant: RestaurantId,
    pub operation: AccessOperation,
    pub resource_type: Option<String>,
    pub outcome: AuditOutcome,
    /// Internal reason. Never returned to the caller.
    pub reason: String,
}

/// Writes audit records as structured events on the `tablefence::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        let resource_type = record.resource_type.as_deref().unwrap_or("-");
        match record.outcome {
            AuditOutcome::PlatformOwnerBypass => info!(
                target: "tablefence::audit",
                actor = %record.actor,
                target_restaurant = %record.target_restaurant,
                operation = %record.operation,
                resource_type,
                "platform owner access"
            ),
            AuditOutcome::Denied => warn!(
                target: "tablefence::audit",
                actor = %record.actor,
                role = %record.role,
                actor_restaurant = record.actor_restaurant.as_ref().map(RestaurantId::as_str),
                target_restaurant = %record.target_restaurant,
                operation = %record.operation,
                resource_type,
                reason = %record.reason,
                "tenant access denied"
            ),
        }
    }
}

/// Keeps records in memory. Intended for tests and local inspection.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl RecordingAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, record: &AuditRecord) {
        self.records.lock().push(record.clone());
    }
}
