//! Identity Map pattern for tracking unique object instances per identifier.
//!
//! The Identity Map ensures that each database row corresponds to exactly one
//! entity instance within a session. This provides:
//!
//! - **Uniqueness**: The same key always resolves to the same handle
//! - **Cache**: Avoids redundant queries for rows already loaded
//! - **Consistency**: Changes to an instance are visible everywhere it's referenced
//!
//! # Design
//!
//! Keys are `(root entity name, identifier)`. Subtypes of one hierarchy share
//! the root's name, so `Dog#1` and `Animal#1` are the same row. Values are
//! [`EntityHandle`]s into the session's entity arena, which makes "same
//! instance" a plain equality check on handles.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//! let key = EntityKey::new("Widget", Value::BigInt(1));
//!
//! map.register(key.clone(), handle)?;
//! assert_eq!(map.lookup(&key), Some(handle));
//!
//! // A different instance under the same key is rejected
//! assert!(map.register(key.clone(), other).is_err());
//! ```

use crate::entity::EntityHandle;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use unitwork_core::{EntityShape, Error, Result, Value};

/// Identity of a persistent row: root entity name plus identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EntityKey {
    pub root: &'static str,
    pub id: Value,
}

impl EntityKey {
    pub fn new(root: &'static str, id: Value) -> Self {
        Self {
            root,
            id: normalize_id(id),
        }
    }

    /// Key of the row `id` of an entity described by `shape`.
    pub fn of(shape: &EntityShape, id: &Value) -> Self {
        Self::new(shape.root_name(), id.clone())
    }
}

/// Integer identifiers are keyed as 64-bit regardless of how they were read.
pub(crate) fn normalize_id(id: Value) -> Value {
    match id {
        Value::Int(i) => Value::BigInt(i64::from(i)),
        other => other,
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.root, self.id)
    }
}

/// Identity Map for tracking unique object instances.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, EntityHandle>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register `handle` under `key`.
    ///
    /// Registering the same handle twice is a no-op. Registering a different
    /// handle under a tracked key fails with [`Error::AlreadyManaged`].
    pub fn register(&mut self, key: EntityKey, handle: EntityHandle) -> Result<()> {
        match self.entries.get(&key) {
            Some(existing) if *existing == handle => Ok(()),
            Some(_) => Err(Error::AlreadyManaged {
                entity: key.root.to_string(),
                id: key.id,
            }),
            None => {
                tracing::trace!(key = %key, handle = %handle, "Registering identity");
                self.entries.insert(key, handle);
                Ok(())
            }
        }
    }

    /// Get the instance registered under `key`.
    pub fn lookup(&self, key: &EntityKey) -> Option<EntityHandle> {
        self.entries.get(key).copied()
    }

    /// Check if an instance is registered under `key`.
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove the registration for `key`.
    ///
    /// # Returns
    ///
    /// The handle that was registered, if any.
    pub fn evict(&mut self, key: &EntityKey) -> Option<EntityHandle> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            tracing::trace!(key = %key, "Evicted identity");
        }
        removed
    }

    /// Remove whatever key `handle` is registered under.
    pub fn evict_handle(&mut self, handle: EntityHandle) -> Option<EntityKey> {
        let key = self
            .entries
            .iter()
            .find(|(_, h)| **h == handle)
            .map(|(k, _)| k.clone())?;
        self.entries.remove(&key);
        Some(key)
    }

    /// Clear all entries from the identity map.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Get the number of entries in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityKey, EntityHandle)> {
        self.entries.iter().map(|(k, h)| (k, *h))
    }
}
