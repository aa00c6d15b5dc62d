//! `tablefence` core: tenant context, platform-owner policy, and the security error taxonomy.

pub mod context;
pub mod error;
pub mod policy;
pub mod types;

pub use context::TenantContext;
pub use error::{SecurityError, SecurityResult};
pub use policy::PlatformOwnerPolicy;
pub use types::{Principal, RestaurantId, UserId, UserRole};
