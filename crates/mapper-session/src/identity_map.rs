//! Identity Map pattern for tracking unique entity instances per primary key.
//!
//! The Identity Map ensures that each storage row corresponds to exactly one
//! entity within a unit of work. This provides:
//!
//! - **Uniqueness**: Same PK always returns the same entity handle
//! - **Cache**: Lookups avoid re-fetching rows that are already tracked
//! - **Consistency**: Changes to an entity are visible everywhere it's used
//!
//! # Design
//!
//! Keys are `(root entity name, serialized primary key)`. Subtypes of one
//! inheritance hierarchy share the root name, so a row is mapped once no
//! matter which subtype loaded it. Composite keys serialize their parts
//! joined with `~~~`.
//!
//! # Example
//!
//! ```ignore
//! let key = ObjectKey::new(&AUTHOR, &[Value::BigInt(1)]);
//! map.insert(key.clone(), handle);
//!
//! // Both lookups yield the same handle, i.e. the same entity
//! assert_eq!(map.get(&key), Some(handle));
//! ```

use mapper_core::{EntityHandle, EntityMeta, Value};
use std::collections::HashMap;
use std::fmt;

const KEY_SEPARATOR: &str = "~~~";

/// Unique key for a row within a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    root: &'static str,
    key: String,
}

impl ObjectKey {
    /// Build the key for `primary_key` values of an entity described by `meta`.
    pub fn new(meta: &EntityMeta, primary_key: &[Value]) -> Self {
        let key = primary_key
            .iter()
            .map(Value::key_fragment)
            .collect::<Vec<_>>()
            .join(KEY_SEPARATOR);
        Self {
            root: meta.root_name(),
            key,
        }
    }

    /// Root entity name.
    pub fn root(&self) -> &'static str {
        self.root
    }

    /// Serialized primary key.
    pub fn serialized_key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.root, self.key)
    }
}

/// Maps row keys to the single entity representing each row.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    entries: HashMap<ObjectKey, EntityHandle>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entity` under `key`, returning the entity previously mapped there.
    pub fn insert(&mut self, key: ObjectKey, entity: EntityHandle) -> Option<EntityHandle> {
        self.entries.insert(key, entity)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<EntityHandle> {
        self.entries.get(key).copied()
    }

    pub fn contains_key(&self, key: &ObjectKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove the entry for `key`.
    pub fn remove(&mut self, key: &ObjectKey) -> Option<EntityHandle> {
        self.entries.remove(key)
    }

    /// Remove `key` only if it still maps to `entity`.
    pub fn remove_entity(&mut self, key: &ObjectKey, entity: EntityHandle) -> bool {
        if self.entries.get(key) == Some(&entity) {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }

    /// Every mapped entity, in creation order.
    pub fn handles(&self) -> Vec<EntityHandle> {
        let mut handles: Vec<EntityHandle> = self.entries.values().copied().collect();
        handles.sort_unstable();
        handles
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, EntityHandle)> {
        self.entries.iter().map(|(k, v)| (k, *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
