//! Platform-owner derivation.
//!
//! [`PlatformOwnerPolicy::is_platform_owner`] is the only place in the
//! workspace that decides whether a principal is a platform owner. The guard,
//! the session-variable binder, and the response sanitizer all read the flag
//! computed here through [`TenantContext`](crate::TenantContext).

use std::collections::BTreeSet;

use crate::error::SecurityError;
use crate::types::UserRole;

/// Allow-list of email addresses eligible for platform-owner privileges.
#[derive(Debug, Clone, Default)]
pub struct PlatformOwnerPolicy {
    allowed_emails: BTreeSet<String>,
}

impl PlatformOwnerPolicy {
    /// Builds a policy from raw email addresses. Blank entries are dropped.
    pub fn new<I, S>(emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let allowed_emails = emails
            .into_iter()
            .map(|e| normalize_email(e.as_ref()))
            .filter(|e| !e.is_empty())
            .collect();
        Self { allowed_emails }
    }

    /// Builds a policy that must be usable in production.
    ///
    /// # Errors
    ///
    /// Returns `SecurityError::Configuration` when the allow-list is empty.
    pub fn required<I, S>(emails: I) -> Result<Self, SecurityError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let policy = Self::new(emails);
        if policy.is_empty() {
            return Err(SecurityError::configuration(
                "platform owner allow-list is empty",
            ));
        }
        Ok(policy)
    }

    /// Returns `true` when no email is allowed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allowed_emails.is_empty()
    }

    /// Number of allowed emails.
    #[must_use]
    pub fn len(&self) -> usize {
        self.allowed_emails.len()
    }

    /// Whether the (normalized) email is on the allow-list.
    #[must_use]
    pub fn allows_email(&self, email: &str) -> bool {
        self.allowed_emails.contains(&normalize_email(email))
    }

    /// Platform-owner status requires the role AND an allow-listed email.
    #[must_use]
    pub fn is_platform_owner(&self, role: UserRole, email: &str) -> bool {
        role == UserRole::PlatformOwner && self.allows_email(email)
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn role_alone_is_not_enough() {
        let policy = PlatformOwnerPolicy::new(["owner@platform.test"]);
        assert!(!policy.is_platform_owner(UserRole::PlatformOwner, "mallory@evil.test"));
    }

    #[test]
    fn email_alone_is_not_enough() {
        let policy = PlatformOwnerPolicy::new(["owner@platform.test"]);
        assert!(!policy.is_platform_owner(UserRole::RestaurantOwner, "owner@platform.test"));
    }

    #[test]
    fn both_conditions_grant() {
        let policy = PlatformOwnerPolicy::new(["Owner@Platform.test "]);
        assert!(policy.is_platform_owner(UserRole::PlatformOwner, " owner@platform.TEST"));
    }

    #[test]
    fn blank_entries_are_ignored() {
        let policy = PlatformOwnerPolicy::new(["", "   "]);
        assert!(policy.is_empty());
        assert!(!policy.is_platform_owner(UserRole::PlatformOwner, ""));
    }

    #[test]
    fn required_rejects_empty_list() {
        let err = PlatformOwnerPolicy::required(Vec::<String>::new()).unwrap_err();
        assert_eq!(err.kind(), "configuration");
        assert_eq!(PlatformOwnerPolicy::required(["a@b.c"]).unwrap().len(), 1);
    }

    proptest! {
        #[test]
        fn non_platform_roles_never_qualify(email in "[a-z]{1,8}@[a-z]{1,8}\\.test") {
            let policy = PlatformOwnerPolicy::new([email.as_str()]);
            for role in [UserRole::Employee, UserRole::Manager, UserRole::RestaurantOwner] {
                prop_assert!(!policy.is_platform_owner(role, &email));
            }
        }
    }
}
