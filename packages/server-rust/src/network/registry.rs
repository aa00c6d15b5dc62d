//! Registry of long-lived client connections, keyed by `(connection, identity)`.
//!
//! Transport connection ids are reused after disconnect/reconnect, so an id
//! alone cannot tell two logical sessions apart. Every entry is keyed by the
//! pair and can only be removed by presenting the same pair. Per-identity
//! counts feed admission control.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tablefence_core::{SecurityError, UserId};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Transport-level connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub connection_id: ConnectionId,
    pub identity: UserId,
    pub remote_addr: SocketAddr,
    pub connected_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {connection_id} is already registered for {identity}")]
    AlreadyRegistered {
        connection_id: ConnectionId,
        identity: UserId,
    },
    #[error("connection {connection_id} is not registered for {identity}")]
    NotRegistered {
        connection_id: ConnectionId,
        identity: UserId,
    },
    #[error("{identity} already holds {held} connections")]
    CapReached { identity: UserId, held: usize },
}

impl From<RegistryError> for SecurityError {
    fn from(err: RegistryError) -> Self {
        let reason = err.to_string();
        match err {
            RegistryError::CapReached { .. } => SecurityError::authorization(reason),
            _ => SecurityError::operation_failed(reason),
        }
    }
}

type Key = (ConnectionId, UserId);

/// Concurrent registry of active connections.
///
/// Writers take the entry's shard lock before touching the per-identity
/// count, always in that order, so `connection_count` never disagrees with
/// the entries for longer than one in-progress call.
#[derive(Debug)]
pub struct ConnectionRegistry {
    entries: DashMap<Key, RegistryEntry>,
    per_identity: DashMap<UserId, usize>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            per_identity: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Hands out a fresh id for transports that do not assign their own.
    /// Ids start at 1.
    pub fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Records `connection_id` as held by `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if the same pair is
    /// already present. The existing entry is kept.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        identity: UserId,
        remote_addr: SocketAddr,
    ) -> Result<(), RegistryError> {
        self.register_capped(connection_id, identity, remote_addr, usize::MAX)
    }

    /// Like [`register`](Self::register), but refuses once `identity` holds
    /// `max` connections. The count is checked and incremented under the
    /// identity's lock, so concurrent callers cannot overshoot `max`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyRegistered`] for a known pair,
    /// [`RegistryError::CapReached`] when `identity` is at `max`.
    pub fn register_capped(
        &self,
        connection_id: ConnectionId,
        identity: UserId,
        remote_addr: SocketAddr,
        max: usize,
    ) -> Result<(), RegistryError> {
        if max == 0 {
            return Err(RegistryError::CapReached { identity, held: 0 });
        }
        match self.entries.entry((connection_id, identity.clone())) {
            Entry::Occupied(_) => {
                warn!(%connection_id, %identity, "duplicate connection registration");
                Err(RegistryError::AlreadyRegistered {
                    connection_id,
                    identity,
                })
            }
            Entry::Vacant(vacant) => {
                let mut held = self.per_identity.entry(identity.clone()).or_insert(0);
                if *held >= max {
                    let held = *held;
                    return Err(RegistryError::CapReached { identity, held });
                }
                *held += 1;
                drop(held);
                debug!(%connection_id, %identity, %remote_addr, "connection registered");
                vacant.insert(RegistryEntry {
                    connection_id,
                    identity,
                    remote_addr,
                    connected_at: Instant::now(),
                });
                Ok(())
            }
        }
    }

    /// Removes the entry for exactly this pair.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotRegistered`] if the pair is unknown,
    /// including when `connection_id` is registered under another identity.
    /// Nothing is removed in that case.
    pub fn unregister(
        &self,
        connection_id: ConnectionId,
        identity: &UserId,
    ) -> Result<RegistryEntry, RegistryError> {
        match self.entries.entry((connection_id, identity.clone())) {
            Entry::Occupied(occupied) => {
                self.decrement(identity);
                debug!(%connection_id, %identity, "connection unregistered");
                Ok(occupied.remove())
            }
            Entry::Vacant(_) => {
                warn!(%connection_id, %identity, "unregister for unknown connection pair");
                Err(RegistryError::NotRegistered {
                    connection_id,
                    identity: identity.clone(),
                })
            }
        }
    }

    /// Active connections held by `identity`.
    #[must_use]
    pub fn connection_count(&self, identity: &UserId) -> usize {
        self.per_identity.get(identity).map_or(0, |count| *count)
    }

    #[must_use]
    pub fn is_registered(&self, connection_id: ConnectionId, identity: &UserId) -> bool {
        self.entries.contains_key(&(connection_id, identity.clone()))
    }

    /// Total number of registered connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Entries held by `identity`, in connection-id order.
    #[must_use]
    pub fn entries_for(&self, identity: &UserId) -> Vec<RegistryEntry> {
        let mut found: Vec<RegistryEntry> = self
            .entries
            .iter()
            .filter(|entry| &entry.key().1 == identity)
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by_key(|entry| entry.connection_id);
        found
    }

    /// Removes and returns every entry. Used during graceful shutdown.
    pub fn drain_all(&self) -> Vec<RegistryEntry> {
        let keys: Vec<Key> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        keys.into_iter()
            .filter_map(|(id, identity)| self.unregister(id, &identity).ok())
            .collect()
    }

    fn decrement(&self, identity: &UserId) {
        if let Entry::Occupied(mut count) = self.per_identity.entry(identity.clone()) {
            *count.get_mut() -= 1;
            if *count.get() == 0 {
                count.remove();
            }
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn user(name: &str) -> UserId {
        UserId::new(name)
    }

    #[test]
    fn register_and_count_per_identity() {
        let registry = ConnectionRegistry::new();
        registry.register(ConnectionId(1), user("alice"), addr()).unwrap();
        registry.register(ConnectionId(2), user("alice"), addr()).unwrap();
        registry.register(ConnectionId(3), user("bob"), addr()).unwrap();

        assert_eq!(registry.count(), 3);
        assert_eq!(registry.connection_count(&user("alice")), 2);
        assert_eq!(registry.connection_count(&user("bob")), 1);
        assert_eq!(registry.connection_count(&user("carol")), 0);
        assert_eq!(registry.entries_for(&user("alice")).len(), 2);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ConnectionRegistry::new();
        registry.register(ConnectionId(1), user("alice"), addr()).unwrap();
        let err = registry
            .register(ConnectionId(1), user("alice"), addr())
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));
        assert_eq!(registry.connection_count(&user("alice")), 1);
    }

    #[test]
    fn reused_connection_id_is_distinct_per_identity() {
        let registry = ConnectionRegistry::new();
        registry.register(ConnectionId(7), user("alice"), addr()).unwrap();
        registry.register(ConnectionId(7), user("bob"), addr()).unwrap();
        assert_eq!(registry.count(), 2);

        registry.unregister(ConnectionId(7), &user("alice")).unwrap();
        assert!(registry.is_registered(ConnectionId(7), &user("bob")));
        assert_eq!(registry.connection_count(&user("bob")), 1);
    }

    #[test]
    fn mismatched_unregister_leaves_entries_untouched() {
        let registry = ConnectionRegistry::new();
        registry.register(ConnectionId(1), user("alice"), addr()).unwrap();

        let err = registry.unregister(ConnectionId(1), &user("mallory")).unwrap_err();
        assert!(matches!(err, RegistryError::NotRegistered { .. }));
        assert!(registry.unregister(ConnectionId(2), &user("alice")).is_err());

        assert!(registry.is_registered(ConnectionId(1), &user("alice")));
        assert_eq!(registry.connection_count(&user("alice")), 1);
    }

    #[test]
    fn unregister_twice_fails_the_second_time() {
        let registry = ConnectionRegistry::new();
        registry.register(ConnectionId(1), user("alice"), addr()).unwrap();
        let entry = registry.unregister(ConnectionId(1), &user("alice")).unwrap();
        assert_eq!(entry.remote_addr, addr());
        assert!(registry.unregister(ConnectionId(1), &user("alice")).is_err());
        assert_eq!(registry.connection_count(&user("alice")), 0);
        assert!(registry.per_identity.is_empty());
    }

    #[test]
    fn capped_registration_stops_at_max() {
        let registry = ConnectionRegistry::new();
        registry.register_capped(ConnectionId(1), user("alice"), addr(), 2).unwrap();
        registry.register_capped(ConnectionId(2), user("alice"), addr(), 2).unwrap();
        let err = registry
            .register_capped(ConnectionId(3), user("alice"), addr(), 2)
            .unwrap_err();
        assert_eq!(err, RegistryError::CapReached { identity: user("alice"), held: 2 });
        assert!(!registry.is_registered(ConnectionId(3), &user("alice")));
        assert_eq!(SecurityError::from(err).kind(), "authorization");

        registry.register_capped(ConnectionId(3), user("bob"), addr(), 2).unwrap();
        registry.unregister(ConnectionId(1), &user("alice")).unwrap();
        registry.register_capped(ConnectionId(3), user("alice"), addr(), 2).unwrap();
        assert_eq!(registry.connection_count(&user("alice")), 2);
    }

    #[test]
    fn capped_registration_holds_across_threads() {
        let registry = std::sync::Arc::new(ConnectionRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|id| {
                let registry = std::sync::Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry
                        .register_capped(ConnectionId(id), user("alice"), addr(), 3)
                        .is_ok()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 3);
        assert_eq!(registry.connection_count(&user("alice")), 3);
        assert_eq!(registry.count(), 3);
    }

    #[test]
    fn allocated_ids_start_at_one() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.allocate_id(), ConnectionId(1));
        assert_eq!(registry.allocate_id(), ConnectionId(2));
    }

    #[test]
    fn drain_all_empties_registry() {
        let registry = ConnectionRegistry::new();
        registry.register(ConnectionId(1), user("alice"), addr()).unwrap();
        registry.register(ConnectionId(2), user("bob"), addr()).unwrap();
        assert_eq!(registry.drain_all().len(), 2);
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.connection_count(&user("alice")), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(u64, u8),
        Unregister(u64, u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..6, 0u8..3).prop_map(|(c, u)| Op::Register(c, u)),
            (0u64..6, 0u8..3).prop_map(|(c, u)| Op::Unregister(c, u)),
        ]
    }

    proptest! {
        #[test]
        fn registry_matches_pair_set_model(ops in proptest::collection::vec(op(), 0..60)) {
            let registry = ConnectionRegistry::new();
            let mut model: HashSet<(u64, u8)> = HashSet::new();

            for op in ops {
                match op {
                    Op::Register(c, u) => {
                        let ok = registry
                            .register(ConnectionId(c), user(&u.to_string()), addr())
                            .is_ok();
                        prop_assert_eq!(ok, model.insert((c, u)));
                    }
                    Op::Unregister(c, u) => {
                        let ok = registry
                            .unregister(ConnectionId(c), &user(&u.to_string()))
                            .is_ok();
                        prop_assert_eq!(ok, model.remove(&(c, u)));
                    }
                }
            }

            prop_assert_eq!(registry.count(), model.len());
            for u in 0u8..3 {
                let expected = model.iter().filter(|(_, mu)| *mu == u).count();
                prop_assert_eq!(registry.connection_count(&user(&u.to_string())), expected);
            }
        }
    }
}
