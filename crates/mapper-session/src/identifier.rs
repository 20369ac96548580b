//! Entity identifiers: placeholders for primary keys that storage has not
//! generated yet.

use mapper_core::{EntityHandle, Value};
use std::collections::HashMap;

/// The primary key of an entity queued for insertion.
///
/// Change sets that reference a not-yet-inserted entity carry its handle
/// instead of a key; the persister looks the identifier up here at dispatch
/// time, after the referenced insert has resolved it.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EntityIdentifier {
    /// Insert not yet executed
    #[default]
    Pending,
    /// Key generated (or supplied) by the insert
    Resolved(Value),
}

impl EntityIdentifier {
    pub fn is_resolved(&self) -> bool {
        matches!(self, EntityIdentifier::Resolved(_))
    }

    /// The resolved key, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            EntityIdentifier::Resolved(v) => Some(v),
            EntityIdentifier::Pending => None,
        }
    }
}

/// Identifiers allocated during one commit cycle, keyed by entity.
#[derive(Debug, Clone, Default)]
pub struct IdentifierMap {
    entries: HashMap<EntityHandle, EntityIdentifier>,
}

impl IdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a pending identifier. Returns `false` if one already exists.
    pub fn allocate(&mut self, entity: EntityHandle) -> bool {
        if self.entries.contains_key(&entity) {
            return false;
        }
        tracing::trace!(entity = %entity, "Allocated entity identifier");
        self.entries.insert(entity, EntityIdentifier::Pending);
        true
    }

    /// Resolve the identifier of `entity` to `value`.
    ///
    /// Entities inserted with a caller-assigned key never had an identifier
    /// allocated; resolving those records the key anyway.
    pub fn resolve(&mut self, entity: EntityHandle, value: Value) {
        self.entries
            .insert(entity, EntityIdentifier::Resolved(value));
    }

    pub fn get(&self, entity: EntityHandle) -> Option<&EntityIdentifier> {
        self.entries.get(&entity)
    }

    pub fn contains(&self, entity: EntityHandle) -> bool {
        self.entries.contains_key(&entity)
    }

    pub fn remove(&mut self, entity: EntityHandle) -> Option<EntityIdentifier> {
        self.entries.remove(&entity)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop resolved identifiers, keeping those still waiting for an insert.
    pub fn retain_pending(&mut self) {
        self.entries.retain(|_, id| !id.is_resolved());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
