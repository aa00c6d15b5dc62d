//! In-memory [`GrantStore`].

use std::collections::BTreeSet;

use async_trait::async_trait;
use dashmap::DashMap;
use tablefence_core::{RestaurantId, SecurityError, UserId};

use crate::traits::GrantStore;

/// Grants held in a concurrent map. Suitable for tests and single-node setups
/// where grants are loaded at startup.
#[derive(Debug, Default)]
pub struct InMemoryGrantStore {
    grants: DashMap<UserId, BTreeSet<RestaurantId>>,
}

impl InMemoryGrantStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `user` access to `restaurant`. Returns `false` if already granted.
    pub fn grant(&self, user: UserId, restaurant: RestaurantId) -> bool {
        self.grants.entry(user).or_default().insert(restaurant)
    }

    /// Revokes a grant. Returns `false` if it did not exist.
    pub fn revoke(&self, user: &UserId, restaurant: &RestaurantId) -> bool {
        let removed = self
            .grants
            .get_mut(user)
            .is_some_and(|mut set| set.remove(restaurant));
        self.grants.remove_if(user, |_, set| set.is_empty());
        removed
    }
}

#[async_trait]
impl GrantStore for InMemoryGrantStore {
    async fn granted_restaurants(
        &self,
        user: &UserId,
    ) -> Result<BTreeSet<RestaurantId>, SecurityError> {
        Ok(self
            .grants
            .get(user)
            .map(|set| set.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grant_and_revoke() {
        let store = InMemoryGrantStore::new();
        let user = UserId::new("u1");
        assert!(store.grant(user.clone(), RestaurantId::new("r-a")));
        assert!(!store.grant(user.clone(), RestaurantId::new("r-a")));
        assert!(store.grant(user.clone(), RestaurantId::new("r-b")));

        let set = store.granted_restaurants(&user).await.unwrap();
        assert_eq!(set.len(), 2);

        assert!(store.revoke(&user, &RestaurantId::new("r-a")));
        assert!(!store.revoke(&user, &RestaurantId::new("r-a")));
        assert!(store.revoke(&user, &RestaurantId::new("r-b")));
        assert!(store.granted_restaurants(&user).await.unwrap().is_empty());
        assert!(store.grants.is_empty());
    }
}
