use crate::error::SecurityError;
use crate::policy::PlatformOwnerPolicy;
use crate::types::{Principal, RestaurantId, UserId, UserRole};

/// Identity and tenancy of the principal acting in one logical operation.
///
/// Constructed once per inbound request or background job from the
/// authenticated [`Principal`]. Fields are private and there is no `Clone`,
/// `Default`, or `Deserialize`: a context can only come out of
/// [`TenantContext::from_principal`], and it is shared within its operation
/// through the carrier's `Arc`, never copied into a cache or pool.
#[derive(Debug, PartialEq, Eq)]
pub struct TenantContext {
    user_id: UserId,
    user_role: UserRole,
    restaurant_id: Option<RestaurantId>,
    is_platform_owner: bool,
}

impl TenantContext {
    /// Derives the context for an authenticated principal.
    ///
    /// `is_platform_owner` is computed by the policy, never taken from the
    /// principal. A principal without a restaurant is accepted only when it
    /// claims the platform-owner role; if the allow-list then rejects it, the
    /// resulting context has no tenant at all and every access check denies.
    ///
    /// # Errors
    ///
    /// Returns `SecurityError::Authentication` when a tenant-level role has no
    /// restaurant or the user id is blank.
    pub fn from_principal(
        principal: &Principal,
        policy: &PlatformOwnerPolicy,
    ) -> Result<Self, SecurityError> {
        if principal.user_id.as_str().trim().is_empty() {
            return Err(SecurityError::authentication("principal has an empty user id"));
        }

        if principal.restaurant_id.is_none() && principal.role != UserRole::PlatformOwner {
            return Err(SecurityError::authentication(format!(
                "user {} with role {} has no restaurant",
                principal.user_id, principal.role
            )));
        }

        let is_platform_owner = policy.is_platform_owner(principal.role, &principal.email);
        if principal.role == UserRole::PlatformOwner && !is_platform_owner {
            tracing::warn!(
                user_id = %principal.user_id,
                "platform_owner role claimed without allow-listed email; privileges not granted"
            );
        }

        Ok(Self {
            user_id: principal.user_id.clone(),
            user_role: principal.role,
            restaurant_id: principal.restaurant_id.clone(),
            is_platform_owner,
        })
    }

    /// Returns a new context in which a platform owner acts on one restaurant.
    ///
    /// # Errors
    ///
    /// Returns `SecurityError::Authorization` unless this context is a
    /// platform owner.
    pub fn acting_for(&self, restaurant_id: RestaurantId) -> Result<Self, SecurityError> {
        if !self.is_platform_owner {
            return Err(SecurityError::authorization(format!(
                "user {} attempted to act for restaurant {restaurant_id}",
                self.user_id
            )));
        }
        Ok(Self {
            user_id: self.user_id.clone(),
            user_role: self.user_role,
            restaurant_id: Some(restaurant_id),
            is_platform_owner: true,
        })
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn user_role(&self) -> UserRole {
        self.user_role
    }

    /// Home (or, for platform owners, target) restaurant, if any.
    #[must_use]
    pub fn restaurant_id(&self) -> Option<&RestaurantId> {
        self.restaurant_id.as_ref()
    }

    /// Platform-owner status as derived by [`PlatformOwnerPolicy`].
    #[must_use]
    pub fn is_platform_owner(&self) -> bool {
        self.is_platform_owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PlatformOwnerPolicy {
        PlatformOwnerPolicy::new(["root@platform.test"])
    }

    fn principal(role: UserRole, email: &str, restaurant: Option<&str>) -> Principal {
        Principal {
            user_id: UserId::new("u-1"),
            email: email.to_string(),
            role,
            restaurant_id: restaurant.map(RestaurantId::from),
        }
    }

    #[test]
    fn tenant_user_gets_home_restaurant() {
        let ctx = TenantContext::from_principal(
            &principal(UserRole::Manager, "m@r.test", Some("r-a")),
            &policy(),
        )
        .unwrap();
        assert_eq!(ctx.restaurant_id(), Some(&RestaurantId::new("r-a")));
        assert!(!ctx.is_platform_owner());
        assert_eq!(ctx.user_role(), UserRole::Manager);
    }

    #[test]
    fn allow_listed_platform_owner_is_flagged() {
        let ctx = TenantContext::from_principal(
            &principal(UserRole::PlatformOwner, "root@platform.test", None),
            &policy(),
        )
        .unwrap();
        assert!(ctx.is_platform_owner());
        assert!(ctx.restaurant_id().is_none());
    }

    #[test]
    fn tampered_role_is_not_flagged() {
        let ctx = TenantContext::from_principal(
            &principal(UserRole::PlatformOwner, "attacker@r.test", Some("r-a")),
            &policy(),
        )
        .unwrap();
        assert!(!ctx.is_platform_owner());
    }

    #[test]
    fn tenant_role_without_restaurant_is_rejected() {
        let err = TenantContext::from_principal(
            &principal(UserRole::Employee, "e@r.test", None),
            &policy(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "authentication");
    }

    #[test]
    fn blank_user_id_is_rejected() {
        let mut p = principal(UserRole::Employee, "e@r.test", Some("r-a"));
        p.user_id = UserId::new("  ");
        assert!(TenantContext::from_principal(&p, &policy()).is_err());
    }

    #[test]
    fn only_platform_owner_may_act_for_another_restaurant() {
        let owner = TenantContext::from_principal(
            &principal(UserRole::PlatformOwner, "root@platform.test", None),
            &policy(),
        )
        .unwrap();
        let acting = owner.acting_for(RestaurantId::new("r-b")).unwrap();
        assert_eq!(acting.restaurant_id(), Some(&RestaurantId::new("r-b")));
        assert!(acting.is_platform_owner());

        let manager = TenantContext::from_principal(
            &principal(UserRole::Manager, "m@r.test", Some("r-a")),
            &policy(),
        )
        .unwrap();
        assert!(manager.acting_for(RestaurantId::new("r-b")).is_err());
    }
}
