//! Change set persister: one change set, one storage call.
//!
//! The persister resolves every identifier placeholder in the payload,
//! applies write-time generators and version maintenance, dispatches to the
//! storage port, then reconciles the entity with what storage reported
//! (generated keys, bumped versions).
//!
//! Re-registering the entity in the identity map and refreshing its snapshot
//! is left to the unit of work, which owns both.

use crate::change_set::{ChangeSet, ChangeSetKind, PayloadValue};
use crate::entity::{EntityArena, Entity};
use crate::identifier::IdentifierMap;
use asupersync::{Cx, Outcome};
use mapper_core::{
    EntityHandle, EntityLabel, Error, FieldKind, LockError, Payload, Result, RowIdentity,
    StorageError, StorageErrorKind, StorageOps, ValidationError, Value,
};

/// A write ready for dispatch.
#[derive(Debug)]
struct PreparedWrite {
    name: &'static str,
    identity: Option<RowIdentity>,
    payload: Payload,
    /// Version the entity carried before this write
    current_version: Option<Value>,
    /// Version the entity carries after this write
    next_version: Option<(usize, Value)>,
    label: EntityLabel,
}

/// Dispatches change sets against a storage handle.
pub struct ChangeSetPersister<'a, S> {
    ops: &'a S,
}

impl<'a, S: StorageOps> ChangeSetPersister<'a, S> {
    pub fn new(ops: &'a S) -> Self {
        Self { ops }
    }

    /// Apply one change set and return the payload as sent to storage.
    #[tracing::instrument(
        level = "debug",
        skip(self, cx, arena, identifiers, change_set),
        fields(entity = %change_set.entity, name = change_set.name, kind = %change_set.kind)
    )]
    pub(crate) async fn persist(
        &self,
        cx: &Cx,
        arena: &mut EntityArena,
        identifiers: &mut IdentifierMap,
        change_set: &ChangeSet,
    ) -> Outcome<Payload, Error> {
        let write = match Self::prepare(arena, identifiers, change_set) {
            Ok(write) => write,
            Err(e) => return Outcome::Err(e),
        };

        match change_set.kind {
            ChangeSetKind::Create => {
                let key = match self.ops.insert(cx, write.name, &write.payload).await {
                    Outcome::Ok(key) => key,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                match Self::finish_create(arena, identifiers, change_set.entity, write, key) {
                    Ok(payload) => Outcome::Ok(payload),
                    Err(e) => Outcome::Err(e),
                }
            }
            ChangeSetKind::Update => {
                let Some(identity) = write.identity.as_ref() else {
                    return Outcome::Err(ValidationError::missing_primary_key(write.label).into());
                };
                let affected = match self.ops.update(cx, write.name, identity, &write.payload).await {
                    Outcome::Ok(n) => n,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                if let Err(e) = Self::check_affected(&write, affected) {
                    return Outcome::Err(e);
                }
                if let Some((idx, version)) = &write.next_version {
                    match arena.get_mut(change_set.entity) {
                        Ok(entity) => entity.set_value_at(*idx, version.clone()),
                        Err(e) => return Outcome::Err(e),
                    }
                }
                Outcome::Ok(write.payload)
            }
            ChangeSetKind::Delete => {
                let Some(identity) = write.identity.as_ref() else {
                    return Outcome::Err(ValidationError::missing_primary_key(write.label).into());
                };
                let affected = match self.ops.delete(cx, write.name, identity).await {
                    Outcome::Ok(n) => n,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                if let Err(e) = Self::check_affected(&write, affected) {
                    return Outcome::Err(e);
                }
                Outcome::Ok(write.payload)
            }
        }
    }

    fn prepare(
        arena: &mut EntityArena,
        identifiers: &IdentifierMap,
        change_set: &ChangeSet,
    ) -> Result<PreparedWrite> {
        let mut payload = Payload::new();
        {
            let label = arena.get(change_set.entity)?.label(change_set.entity);
            for (field, value) in &change_set.payload {
                let resolved = resolve(arena, identifiers, &label, field, value)?;
                payload.insert(*field, resolved);
            }
        }

        let entity = arena.get_mut(change_set.entity)?;
        let meta = entity.meta();
        let label = entity.label(change_set.entity);
        let kind = change_set.kind;

        if kind != ChangeSetKind::Delete {
            for (idx, field) in meta.fields.iter().enumerate() {
                if let Some(generate) = field.on_update {
                    let value = generate();
                    entity.set_value_at(idx, value.clone());
                    payload.insert(field.name, value);
                }
            }
        }

        let identity = entity.primary_key().map(|pk| {
            RowIdentity::new(meta.primary_key_names().into_iter().zip(pk).collect())
        });

        let mut write = PreparedWrite {
            name: meta.name,
            identity,
            payload,
            current_version: None,
            next_version: None,
            label,
        };

        if let (Some(idx), Some(field)) = (meta.version_index(), meta.version_field()) {
            let current = entity.value_at(idx).clone();
            match kind {
                ChangeSetKind::Create => {
                    if current.is_null() {
                        let seed = initial_version(field.kind);
                        entity.set_value_at(idx, seed.clone());
                        write.payload.insert(field.name, seed);
                    }
                }
                ChangeSetKind::Update => {
                    let next = if current.is_null() {
                        initial_version(field.kind)
                    } else {
                        next_version(field.kind, &current).ok_or_else(|| {
                            let mut err = ValidationError::invalid_payload(write.label.clone());
                            err.add_custom(field.name, "version counter is exhausted");
                            Error::from(err)
                        })?
                    };
                    write.payload.insert(field.name, next.clone());
                    write.next_version = Some((idx, next));
                    if !current.is_null() {
                        write.identity = write
                            .identity
                            .map(|id| id.with_version(field.name, current.clone()));
                        write.current_version = Some(current);
                    }
                }
                ChangeSetKind::Delete => {
                    if !current.is_null() {
                        write.identity = write
                            .identity
                            .map(|id| id.with_version(field.name, current.clone()));
                        write.current_version = Some(current);
                    }
                }
            }
        }

        tracing::trace!(
            name = write.name,
            fields = write.payload.len(),
            versioned = write.current_version.is_some(),
            "Prepared write"
        );
        Ok(write)
    }

    fn check_affected(write: &PreparedWrite, affected: u64) -> Result<()> {
        if affected > 0 {
            return Ok(());
        }
        match &write.current_version {
            Some(version) => {
                tracing::debug!(entity = %write.label, version = %version, "Versioned write matched no row");
                Err(LockError::lock_failed(write.label.clone(), Some(version.clone())).into())
            }
            None => {
                tracing::debug!(entity = %write.label, "Write matched no row");
                Ok(())
            }
        }
    }

    fn finish_create(
        arena: &mut EntityArena,
        identifiers: &mut IdentifierMap,
        handle: EntityHandle,
        mut write: PreparedWrite,
        key: Value,
    ) -> Result<Payload> {
        let entity = arena.get_mut(handle)?;
        if !entity.has_primary_key() {
            if key.is_null() {
                return Err(StorageError::new(
                    StorageErrorKind::Other,
                    format!("insert of {} returned no generated key", write.label),
                )
                .into());
            }
            entity.assign_primary_key(&key);
        }
        let pk = entity
            .primary_key_value()
            .ok_or_else(|| Error::from(ValidationError::missing_primary_key(entity.label(handle))))?;
        record_key(entity, &mut write.payload);
        identifiers.resolve(handle, pk);
        entity.mark_synced();
        tracing::trace!(entity = %entity.label(handle), "Entity inserted");
        Ok(write.payload)
    }
}

/// Resolve a payload value to what storage receives.
fn resolve(
    arena: &EntityArena,
    identifiers: &IdentifierMap,
    label: &EntityLabel,
    field: &str,
    value: &PayloadValue,
) -> Result<Value> {
    match value {
        PayloadValue::Value(v) => Ok(v.clone()),
        PayloadValue::Identifier(target) => {
            if let Some(resolved) = identifiers.get(*target).and_then(|id| id.value()) {
                return Ok(resolved.clone());
            }
            arena
                .get(*target)?
                .primary_key_value()
                .ok_or_else(|| ValidationError::unresolved_identifier(label.clone(), field).into())
        }
        PayloadValue::List(items) => items
            .iter()
            .map(|item| resolve(arena, identifiers, label, field, item))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
    }
}

fn record_key(entity: &Entity, payload: &mut Payload) {
    for (name, value) in entity.values() {
        if entity.meta().field(name).is_some_and(|f| f.primary_key) {
            payload.insert(name, value.clone());
        }
    }
}

fn initial_version(kind: FieldKind) -> Value {
    match kind {
        FieldKind::Timestamp | FieldKind::Date => Value::now(),
        _ => Value::BigInt(1),
    }
}

/// `None` once an integer counter cannot be bumped any further.
fn next_version(kind: FieldKind, current: &Value) -> Option<Value> {
    match (kind, current.as_i64()) {
        (FieldKind::Timestamp | FieldKind::Date, _) | (_, None) => Some(Value::now()),
        (_, Some(v)) => v.checked_add(1).map(Value::BigInt),
    }
}
