//! Change set computation.
//!
//! The computer owns the snapshot of every tracked entity and turns the
//! difference between a live entity and its snapshot into a [`ChangeSet`]:
//!
//! - no snapshot: a CREATE carrying the full field set
//! - snapshot: an UPDATE carrying only the fields that differ, or nothing
//!   at all when the diff is empty
//!
//! Owning to-one relations contribute the target's primary key, or an
//! [`PayloadValue::Identifier`] placeholder while the target is not inserted.
//! Dirty owning to-many relations contribute their identity list.

use crate::change_set::{ChangePayload, ChangeSet, ChangeSetKind, PayloadValue, Snapshot};
use crate::entity::{EntityArena, RelationSlot};
use mapper_core::{EntityHandle, Error, Result, ValidationError};
use std::collections::HashMap;

/// Diffs live entities against their last-known persisted state.
#[derive(Debug, Clone, Default)]
pub struct ChangeSetComputer {
    snapshots: HashMap<EntityHandle, Snapshot>,
    strict: bool,
}

impl ChangeSetComputer {
    /// Create a computer. With `strict` set, values whose kind does not match
    /// the field declaration are rejected instead of coerced.
    pub fn new(strict: bool) -> Self {
        Self {
            snapshots: HashMap::new(),
            strict,
        }
    }

    /// The snapshot of `entity`, if one was taken.
    pub fn snapshot(&self, entity: EntityHandle) -> Option<&Snapshot> {
        self.snapshots.get(&entity)
    }

    pub fn has_snapshot(&self, entity: EntityHandle) -> bool {
        self.snapshots.contains_key(&entity)
    }

    /// Capture the current persisted-field state of `entity`.
    pub(crate) fn take_snapshot(&mut self, arena: &EntityArena, entity: EntityHandle) -> Result<()> {
        let snapshot = Self::prepare(arena, entity)?;
        tracing::trace!(entity = %entity, fields = snapshot.len(), "Taking entity snapshot");
        self.snapshots.insert(entity, snapshot);
        Ok(())
    }

    /// Overwrite one field of an existing snapshot.
    pub(crate) fn record(&mut self, entity: EntityHandle, field: &'static str, value: PayloadValue) {
        if let Some(snapshot) = self.snapshots.get_mut(&entity) {
            snapshot.insert(field, value);
        }
    }

    pub(crate) fn forget(&mut self, entity: EntityHandle) {
        self.snapshots.remove(&entity);
    }

    /// Reset the snapshot of `entity` to what `before` held for it.
    pub(crate) fn restore_snapshot(&mut self, before: &ChangeSetComputer, entity: EntityHandle) {
        match before.snapshots.get(&entity) {
            Some(snapshot) => {
                self.snapshots.insert(entity, snapshot.clone());
            }
            None => self.forget(entity),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Current persisted-field state of `entity`: scalar fields plus the
    /// targets of owning to-one relations.
    pub(crate) fn prepare(arena: &EntityArena, entity: EntityHandle) -> Result<Snapshot> {
        let e = arena.get(entity)?;
        let meta = e.meta();
        let mut data = Snapshot::new();
        for (name, value) in e.values() {
            data.insert(name, PayloadValue::Value(value.clone()));
        }
        for (idx, rel) in meta.relations.iter().enumerate() {
            if !rel.owns_foreign_key() {
                continue;
            }
            let value = match e.slot(idx) {
                RelationSlot::One(Some(target)) => identity_of(arena, *target)?,
                _ => PayloadValue::Value(mapper_core::Value::Null),
            };
            data.insert(rel.name, value);
        }
        Ok(data)
    }

    /// Compute the change set for `entity`, or `None` when nothing changed.
    ///
    /// Clears the dirty flag of every owning collection it folds into the
    /// payload. That happens here, on successful computation, not once the
    /// write succeeds.
    pub fn compute(
        &mut self,
        arena: &mut EntityArena,
        entity: EntityHandle,
    ) -> Result<Option<ChangeSet>> {
        let meta = arena.get(entity)?.meta();
        if meta.readonly {
            return Ok(None);
        }

        let original = self.snapshots.get(&entity).cloned();
        let kind = if original.is_some() {
            ChangeSetKind::Update
        } else {
            ChangeSetKind::Create
        };

        if kind == ChangeSetKind::Create {
            let e = arena.get_mut(entity)?;
            for (idx, field) in meta.fields.iter().enumerate() {
                if let Some(generate) = field.on_create {
                    if e.value_at(idx).is_null() {
                        e.set_value_at(idx, generate());
                    }
                }
            }
        }

        let current = Self::prepare(arena, entity)?;
        let mut payload = match &original {
            Some(orig) => diff(orig, current),
            None => {
                let mut full = current;
                for name in meta.primary_key_names() {
                    if full
                        .get(name)
                        .and_then(PayloadValue::as_value)
                        .is_some_and(mapper_core::Value::is_null)
                    {
                        full.remove(name);
                    }
                }
                full
            }
        };

        self.validate(arena, entity, &mut payload, kind)?;
        collect_owned_collections(arena, entity, &mut payload)?;

        if kind == ChangeSetKind::Update && payload.is_empty() {
            tracing::trace!(entity = %entity, "No changes since snapshot");
            return Ok(None);
        }

        tracing::trace!(
            entity = %entity,
            name = meta.name,
            kind = %kind,
            fields = payload.len(),
            "Computed change set"
        );
        let mut change_set = ChangeSet::new(entity, meta.name, kind, payload);
        change_set.original = original;
        Ok(Some(change_set))
    }

    /// Check collection initialization and field kinds. Coerced values are
    /// written back to both payload and entity.
    fn validate(
        &self,
        arena: &mut EntityArena,
        entity: EntityHandle,
        payload: &mut ChangePayload,
        kind: ChangeSetKind,
    ) -> Result<()> {
        let e = arena.get_mut(entity)?;
        let meta = e.meta();

        if e.is_initialized() {
            for (idx, rel) in meta.relations.iter().enumerate() {
                if matches!(e.slot(idx), RelationSlot::Many(None)) {
                    return Err(ValidationError::collection_not_initialized(
                        e.label(entity),
                        rel.name,
                    )
                    .into());
                }
            }
        }

        let mut errors = ValidationError::invalid_payload(e.label(entity));
        let mut coerced = Vec::new();
        for (name, value) in payload.iter_mut() {
            let (Some(idx), PayloadValue::Value(v)) = (meta.field_index(name), &mut *value) else {
                continue;
            };
            let field = &meta.fields[idx];
            if v.is_null() {
                let generated = kind == ChangeSetKind::Create && field.is_generated();
                if !field.nullable && !generated {
                    errors.add_required(*name);
                }
            } else if !field.kind.accepts(v) {
                match field.kind.coerce(v).filter(|_| !self.strict) {
                    Some(fixed) => {
                        *v = fixed.clone();
                        coerced.push((idx, fixed));
                    }
                    None => errors.add_type(*name, field.kind.name(), v),
                }
            }
        }
        errors.into_result().map_err(Error::from)?;

        for (idx, value) in coerced {
            e.set_value_at(idx, value);
        }
        Ok(())
    }
}

/// Identity of `target` as it appears in a payload: its key, or a
/// placeholder while the key is unknown.
pub(crate) fn identity_of(arena: &EntityArena, target: EntityHandle) -> Result<PayloadValue> {
    Ok(match arena.get(target)?.primary_key_value() {
        Some(pk) => PayloadValue::Value(pk),
        None => PayloadValue::Identifier(target),
    })
}

/// Fields of `current` that differ from `original`.
pub(crate) fn diff(original: &Snapshot, current: Snapshot) -> ChangePayload {
    current
        .into_iter()
        .filter(|(name, value)| {
            original
                .get(name)
                .is_none_or(|before| !before.semantic_eq(value))
        })
        .collect()
}

fn collect_owned_collections(
    arena: &mut EntityArena,
    entity: EntityHandle,
    payload: &mut ChangePayload,
) -> Result<()> {
    let meta = arena.get(entity)?.meta();
    for (idx, rel) in meta.relations.iter().enumerate() {
        if !rel.owns_collection() {
            continue;
        }
        let items = match arena.get(entity)?.slot(idx) {
            RelationSlot::Many(Some(coll)) if coll.is_dirty() => coll.items().to_vec(),
            _ => continue,
        };
        let identities = items
            .into_iter()
            .map(|item| identity_of(arena, item))
            .collect::<Result<Vec<_>>>()?;
        payload.insert(rel.name, PayloadValue::List(identities));
        if let RelationSlot::Many(Some(coll)) = arena.get_mut(entity)?.slot_mut(idx) {
            coll.set_dirty(false);
        }
    }
    Ok(())
}
