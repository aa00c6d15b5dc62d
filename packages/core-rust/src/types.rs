use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Declares an opaque string identifier newtype.
macro_rules! opaque_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

opaque_id!(
    /// Opaque identifier of an authenticated user.
    UserId
);

opaque_id!(
    /// Opaque identifier of a restaurant (the tenant).
    RestaurantId
);

/// Role assigned to a user by the identity provider.
///
/// The role alone never grants platform-owner privileges; see
/// [`PlatformOwnerPolicy`](crate::PlatformOwnerPolicy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Employee,
    Manager,
    RestaurantOwner,
    PlatformOwner,
}

impl UserRole {
    /// Wire name of the role, as written into the `app.current_user_role` variable.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Employee => "employee",
            Self::Manager => "manager",
            Self::RestaurantOwner => "restaurant_owner",
            Self::PlatformOwner => "platform_owner",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown role name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown user role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for UserRole {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "employee" => Ok(Self::Employee),
            "manager" => Ok(Self::Manager),
            "restaurant_owner" => Ok(Self::RestaurantOwner),
            "platform_owner" => Ok(Self::PlatformOwner),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Authenticated principal handed over by the transport layer.
///
/// Everything here is as asserted by the identity provider. It is the input
/// from which a [`TenantContext`](crate::TenantContext) is derived and is
/// never consulted directly for authorization decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// Unique identifier for the authenticated user.
    pub user_id: UserId,
    /// Email address bound to the account; checked against the platform-owner allow-list.
    pub email: String,
    /// Role claimed for this user.
    pub role: UserRole,
    /// Home restaurant of the user. Absent only for platform-level accounts.
    pub restaurant_id: Option<RestaurantId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_wire_name() {
        for role in [
            UserRole::Employee,
            UserRole::Manager,
            UserRole::RestaurantOwner,
            UserRole::PlatformOwner,
        ] {
            assert_eq!(role.as_str().parse::<UserRole>().unwrap(), role);
        }
    }

    #[test]
    fn unknown_role_is_rejected() {
        let err = "superuser".parse::<UserRole>().unwrap_err();
        assert_eq!(err, UnknownRole("superuser".to_string()));
    }

    #[test]
    fn role_serializes_as_snake_case() {
        let json = serde_json::to_string(&UserRole::RestaurantOwner).unwrap();
        assert_eq!(json, "\"restaurant_owner\"");
    }

    #[test]
    fn ids_are_transparent_in_json() {
        let id = RestaurantId::new("r-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"r-1\"");
        assert_eq!(id.to_string(), "r-1");
    }
}
