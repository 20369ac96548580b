//! Managed entities and the arena that owns them.
//!
//! Every entity a unit of work knows about lives in its [`EntityArena`].
//! Callers hold [`EntityHandle`]s; relations between entities are handles too,
//! so cyclic graphs (self references, mutual foreign keys) need no shared
//! ownership.

use mapper_core::{
    EntityHandle, EntityLabel, EntityMeta, Error, Payload, Result, ValidationError, Value,
};
use std::collections::HashSet;

/// The loaded items of a to-many relation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    items: Vec<EntityHandle>,
    dirty: bool,
}

impl Collection {
    /// Create an empty, clean collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clean collection from loaded items.
    pub fn from_items(items: Vec<EntityHandle>) -> Self {
        Self {
            items,
            dirty: false,
        }
    }

    pub fn items(&self) -> &[EntityHandle] {
        &self.items
    }

    pub fn contains(&self, item: EntityHandle) -> bool {
        self.items.contains(&item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether items were added or removed since the last change set.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// Add an item. Returns `false` if it was already present.
    pub(crate) fn add(&mut self, item: EntityHandle) -> bool {
        if self.items.contains(&item) {
            return false;
        }
        self.items.push(item);
        self.dirty = true;
        true
    }

    /// Remove an item. Returns `false` if it was not present.
    pub(crate) fn remove(&mut self, item: EntityHandle) -> bool {
        let before = self.items.len();
        self.items.retain(|h| *h != item);
        let removed = self.items.len() != before;
        self.dirty |= removed;
        removed
    }

    /// Take the items out, leaving a clean empty collection behind.
    pub(crate) fn take_items(&mut self) -> Vec<EntityHandle> {
        self.dirty = false;
        std::mem::take(&mut self.items)
    }
}

/// Value of one relation on an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationSlot {
    /// To-one relation target
    One(Option<EntityHandle>),
    /// To-many relation; `None` until the collection is initialized
    Many(Option<Collection>),
}

/// A managed domain object: field values plus relation slots, described by
/// its static [`EntityMeta`].
#[derive(Debug, Clone)]
pub struct Entity {
    meta: &'static EntityMeta,
    values: Vec<Value>,
    relations: Vec<RelationSlot>,
    initialized: bool,
}

impl Entity {
    /// A fresh, fully initialized entity with every field NULL and every
    /// collection empty.
    pub(crate) fn new(meta: &'static EntityMeta) -> Self {
        let relations = meta
            .relations
            .iter()
            .map(|r| {
                if r.kind.is_to_one() {
                    RelationSlot::One(None)
                } else {
                    RelationSlot::Many(Some(Collection::new()))
                }
            })
            .collect();
        Self {
            meta,
            values: vec![Value::Null; meta.fields.len()],
            relations,
            initialized: true,
        }
    }

    /// An uninitialized reference: only the primary key is known and no
    /// collection is loaded.
    pub(crate) fn reference(meta: &'static EntityMeta, primary_key: &[Value]) -> Self {
        let mut entity = Self::new(meta);
        entity.initialized = false;
        for slot in &mut entity.relations {
            if let RelationSlot::Many(coll) = slot {
                *coll = None;
            }
        }
        for (idx, value) in meta.primary_key_indices().zip(primary_key) {
            entity.values[idx] = value.clone();
        }
        entity
    }

    pub fn meta(&self) -> &'static EntityMeta {
        self.meta
    }

    pub fn name(&self) -> &'static str {
        self.meta.name
    }

    /// Whether the entity's fields are loaded (as opposed to a bare reference).
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Get a field value by name.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.meta.field_index(field).map(|idx| &self.values[idx])
    }

    /// Set a field value by name.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
        let idx = self
            .meta
            .field_index(field)
            .ok_or_else(|| Error::from(ValidationError::unknown_field(self.meta.name, field)))?;
        self.values[idx] = value.into();
        Ok(())
    }

    /// Iterate over `(field, value)` pairs in declaration order.
    pub fn values(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.meta.fields.iter().map(|f| f.name).zip(self.values.iter())
    }

    pub(crate) fn value_at(&self, idx: usize) -> &Value {
        &self.values[idx]
    }

    pub(crate) fn set_value_at(&mut self, idx: usize, value: Value) {
        self.values[idx] = value;
    }

    /// Primary key values, or `None` while any key column is NULL.
    pub fn primary_key(&self) -> Option<Vec<Value>> {
        let pk: Vec<Value> = self
            .meta
            .primary_key_indices()
            .map(|idx| self.values[idx].clone())
            .collect();
        if pk.is_empty() || pk.iter().any(Value::is_null) {
            None
        } else {
            Some(pk)
        }
    }

    pub fn has_primary_key(&self) -> bool {
        self.primary_key().is_some()
    }

    /// The primary key as one value: the key itself, or an array for
    /// composite keys.
    pub fn primary_key_value(&self) -> Option<Value> {
        self.primary_key().map(|mut pk| {
            if pk.len() == 1 {
                pk.remove(0)
            } else {
                Value::Array(pk)
            }
        })
    }

    /// Assign a generated key. Composite keys are expected as an array.
    pub(crate) fn assign_primary_key(&mut self, key: &Value) {
        let indices: Vec<usize> = self.meta.primary_key_indices().collect();
        match (indices.as_slice(), key) {
            ([idx], _) => self.values[*idx] = key.clone(),
            (many, Value::Array(parts)) if many.len() == parts.len() => {
                for (idx, part) in many.iter().zip(parts) {
                    self.values[*idx] = part.clone();
                }
            }
            _ => {}
        }
    }

    /// Current version value for versioned entity types.
    pub fn version(&self) -> Option<&Value> {
        self.meta.version_index().map(|idx| &self.values[idx])
    }

    /// Target of a to-one relation.
    pub fn related(&self, relation: &str) -> Option<EntityHandle> {
        match self.slot_by_name(relation)? {
            RelationSlot::One(target) => *target,
            RelationSlot::Many(_) => None,
        }
    }

    /// A loaded to-many relation.
    pub fn collection(&self, relation: &str) -> Option<&Collection> {
        match self.slot_by_name(relation)? {
            RelationSlot::Many(coll) => coll.as_ref(),
            RelationSlot::One(_) => None,
        }
    }

    /// Drop a loaded collection; it must be initialized again before this
    /// entity can be flushed.
    pub fn unload_collection(&mut self, relation: &str) -> Result<()> {
        let idx = self.relation_index(relation)?;
        if let RelationSlot::Many(coll) = &mut self.relations[idx] {
            *coll = None;
        }
        Ok(())
    }

    fn slot_by_name(&self, relation: &str) -> Option<&RelationSlot> {
        self.meta
            .relation_index(relation)
            .map(|idx| &self.relations[idx])
    }

    pub(crate) fn relation_index(&self, relation: &str) -> Result<usize> {
        self.meta
            .relation_index(relation)
            .ok_or_else(|| Error::from(ValidationError::unknown_field(self.meta.name, relation)))
    }

    pub(crate) fn slot(&self, idx: usize) -> &RelationSlot {
        &self.relations[idx]
    }

    pub(crate) fn slot_mut(&mut self, idx: usize) -> &mut RelationSlot {
        &mut self.relations[idx]
    }

    /// All entities reachable through one relation slot.
    pub(crate) fn targets(&self, idx: usize) -> Vec<EntityHandle> {
        match &self.relations[idx] {
            RelationSlot::One(target) => target.iter().copied().collect(),
            RelationSlot::Many(Some(coll)) => coll.items().to_vec(),
            RelationSlot::Many(None) => Vec::new(),
        }
    }

    fn same_targets(&self, other: &Entity) -> bool {
        (0..self.relations.len()).all(|idx| self.targets(idx) == other.targets(idx))
    }

    /// Fill fields from a loaded row and mark the entity initialized.
    ///
    /// Unknown columns are ignored. Collections that were never loaded start
    /// out empty and clean.
    pub(crate) fn load_row(&mut self, row: &Payload) {
        for (name, value) in row {
            if let Some(idx) = self.meta.field_index(name) {
                self.values[idx] = value.clone();
            }
        }
        for slot in &mut self.relations {
            if let RelationSlot::Many(coll @ None) = slot {
                *coll = Some(Collection::new());
            }
        }
        self.initialized = true;
    }

    /// Reset dirty flags on inverse collections once the row is written.
    pub(crate) fn mark_synced(&mut self) {
        self.initialized = true;
        for (rel, slot) in self.meta.relations.iter().zip(&mut self.relations) {
            if let RelationSlot::Many(Some(coll)) = slot {
                if !rel.owns_collection() {
                    coll.set_dirty(false);
                }
            }
        }
    }

    pub fn label(&self, handle: EntityHandle) -> EntityLabel {
        EntityLabel::new(self.meta.name)
            .with_handle(handle)
            .with_primary_key(self.primary_key())
    }
}

/// Owns every entity of one unit of work.
#[derive(Debug, Clone)]
pub(crate) struct EntityArena {
    session: u32,
    slots: Vec<Entity>,
}

impl EntityArena {
    pub(crate) fn new(session: u32) -> Self {
        Self {
            session,
            slots: Vec::new(),
        }
    }

    pub(crate) fn session(&self) -> u32 {
        self.session
    }

    pub(crate) fn insert(&mut self, entity: Entity) -> EntityHandle {
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(entity);
        EntityHandle::new(self.session, index)
    }

    pub(crate) fn contains(&self, handle: EntityHandle) -> bool {
        handle.session() == self.session && handle.index() < self.slots.len()
    }

    pub(crate) fn get(&self, handle: EntityHandle) -> Result<&Entity> {
        if !self.contains(handle) {
            return Err(Self::foreign(handle));
        }
        Ok(&self.slots[handle.index()])
    }

    pub(crate) fn get_mut(&mut self, handle: EntityHandle) -> Result<&mut Entity> {
        if !self.contains(handle) {
            return Err(Self::foreign(handle));
        }
        Ok(&mut self.slots[handle.index()])
    }

    /// Copy relation slots back from an earlier copy of this arena.
    pub(crate) fn restore_relations(&mut self, before: &EntityArena) {
        for (entity, earlier) in self.slots.iter_mut().zip(&before.slots) {
            entity.relations.clone_from(&earlier.relations);
        }
    }

    /// Like [`restore_relations`](Self::restore_relations), but entities in
    /// `settled` keep their relations unless a target moved since `before`.
    pub(crate) fn restore_unsettled_relations(
        &mut self,
        before: &EntityArena,
        settled: &HashSet<EntityHandle>,
    ) {
        let session = self.session;
        for (index, (entity, earlier)) in self.slots.iter_mut().zip(&before.slots).enumerate() {
            let handle = EntityHandle::new(session, u32::try_from(index).unwrap_or(u32::MAX));
            if !settled.contains(&handle) || !entity.same_targets(earlier) {
                entity.relations.clone_from(&earlier.relations);
            }
        }
    }

    fn foreign(handle: EntityHandle) -> Error {
        ValidationError::entity_not_managed(EntityLabel::new("entity").with_handle(handle)).into()
    }
}
