//! Unit of Work: tracked entities, queued intents and the commit algorithm.
//!
//! # Overview
//!
//! The Unit of Work:
//! - Owns every managed entity (callers hold [`EntityHandle`]s)
//! - Maps each storage row to exactly one entity through the [`IdentityMap`]
//! - Queues persist, remove and orphan-removal intents, cascading them across
//!   relations with a visited set so cyclic graphs terminate
//! - Computes change sets on commit and applies them one at a time, in
//!   dependency order, inside a transaction when the port supports one
//!
//! # Commit
//!
//! 1. Every identity-mapped entity not slated for removal is re-enqueued, so
//!    entities mutated in place are diffed too.
//! 2. The persist queue is walked depth first. Relations are visited before
//!    the entity itself, which allocates identifiers for newly reachable
//!    entities and orders referenced inserts first. A foreign key pointing
//!    back into the walk is detached and recorded as an extra update.
//! 3. Orphans are folded into the remove queue and become DELETEs.
//! 4. Change sets, then extra updates, then deletes are dispatched.
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new();
//! let author = uow.create(&AUTHOR);
//! uow.entity_mut(author)?.set("name", "Jon")?;
//! uow.persist(author)?;
//!
//! let report = uow.commit(&cx, &storage).await;
//! ```

use crate::change_set::{
    AppliedChangeSet, ChangeSet, ChangeSetKind, CommitPlan, CommitReport, ExtraUpdate,
    PayloadValue, Snapshot,
};
use crate::computer::{diff, identity_of, ChangeSetComputer};
use crate::entity::{Collection, Entity, EntityArena, RelationSlot};
use crate::hooks::{HookRegistry, LifecycleEvent};
use crate::identifier::{EntityIdentifier, IdentifierMap};
use crate::identity_map::{IdentityMap, ObjectKey};
use crate::persister::ChangeSetPersister;
use crate::queue::HandleQueue;
use crate::{FailurePolicy, PendingCounts, SessionConfig};
use asupersync::{Cx, Outcome};
use mapper_core::{
    Cascade, EntityHandle, EntityLabel, EntityMeta, Error, Payload, RelationInfo, Result,
    RowIdentity, StorageError, StorageErrorKind, StorageOps, StoragePort, StorageTransaction,
    ValidationError, ValidationErrorKind, Value,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_SESSION: AtomicU32 = AtomicU32::new(1);

/// A lookup filter for [`UnitOfWork::try_get_by_id`].
#[derive(Debug, Clone, PartialEq)]
pub enum KeyFilter {
    /// A primary key value; composite keys as an array
    Key(Value),
    /// Composite key parts in declaration order
    Composite(Vec<Value>),
    /// Field/value pairs naming exactly the primary key fields
    Fields(Vec<(&'static str, Value)>),
    /// An entity bearing the key
    Entity(EntityHandle),
}

impl From<Value> for KeyFilter {
    fn from(value: Value) -> Self {
        KeyFilter::Key(value)
    }
}

impl From<EntityHandle> for KeyFilter {
    fn from(entity: EntityHandle) -> Self {
        KeyFilter::Entity(entity)
    }
}

/// State restored when a commit fails.
#[derive(Debug, Clone)]
struct Checkpoint {
    arena: EntityArena,
    computer: ChangeSetComputer,
    identity_map: IdentityMap,
    identifiers: IdentifierMap,
    persist_queue: HandleQueue,
    remove_queue: HandleQueue,
    orphan_queue: HandleQueue,
}

/// Tracks managed entities and writes their changes on commit.
///
/// A unit of work is driven by one caller at a time; `commit` takes
/// `&mut self`, so two overlapping commits on one instance cannot compile.
#[derive(Debug)]
pub struct UnitOfWork {
    arena: EntityArena,
    computer: ChangeSetComputer,
    identity_map: IdentityMap,
    identifiers: IdentifierMap,
    persist_queue: HandleQueue,
    remove_queue: HandleQueue,
    orphan_queue: HandleQueue,
    hooks: HookRegistry,
    config: SessionConfig,
}

impl Default for UnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitOfWork {
    /// Create a unit of work with the default configuration.
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let session = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session, ?config, "Opening unit of work");
        Self {
            arena: EntityArena::new(session),
            computer: ChangeSetComputer::new(config.strict_validation),
            identity_map: IdentityMap::new(),
            identifiers: IdentifierMap::new(),
            persist_queue: HandleQueue::new(),
            remove_queue: HandleQueue::new(),
            orphan_queue: HandleQueue::new(),
            hooks: HookRegistry::new(),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Identifier stamped into every handle this unit of work hands out.
    pub fn session_id(&self) -> u32 {
        self.arena.session()
    }

    // ========================================================================
    // Entities
    // ========================================================================

    /// Create a new, unpersisted entity.
    pub fn create(&mut self, meta: &'static EntityMeta) -> EntityHandle {
        self.arena.insert(Entity::new(meta))
    }

    /// Create a new entity and set its fields.
    pub fn create_with(
        &mut self,
        meta: &'static EntityMeta,
        values: impl IntoIterator<Item = (&'static str, Value)>,
    ) -> Result<EntityHandle> {
        let mut entity = Entity::new(meta);
        for (field, value) in values {
            entity.set(field, value)?;
        }
        Ok(self.arena.insert(entity))
    }

    pub fn entity(&self, entity: EntityHandle) -> Result<&Entity> {
        self.arena.get(entity)
    }

    pub fn entity_mut(&mut self, entity: EntityHandle) -> Result<&mut Entity> {
        self.arena.get_mut(entity)
    }

    /// Return the identity-mapped entity for `primary_key`, or register an
    /// uninitialized reference to it.
    pub fn reference(&mut self, meta: &'static EntityMeta, primary_key: &[Value]) -> EntityHandle {
        let key = ObjectKey::new(meta, primary_key);
        if let Some(existing) = self.identity_map.get(&key) {
            return existing;
        }
        let handle = self.arena.insert(Entity::reference(meta, primary_key));
        tracing::trace!(entity = %handle, key = %key, "Registered reference");
        self.identity_map.insert(key, handle);
        handle
    }

    /// Register a loaded row.
    ///
    /// Returns the entity already mapped to the row's key when there is one,
    /// initializing it in place if it was a bare reference. Foreign key columns
    /// of owning relations are recorded in the snapshot so that populating the
    /// relation afterwards is not seen as a change.
    pub fn merge_row(&mut self, meta: &'static EntityMeta, row: Payload) -> Result<EntityHandle> {
        let pk: Vec<Value> = meta
            .primary_key_names()
            .into_iter()
            .map(|name| row.get(name).cloned().unwrap_or(Value::Null))
            .collect();
        if pk.is_empty() || pk.iter().any(Value::is_null) {
            return Err(ValidationError::missing_primary_key(EntityLabel::new(meta.name)).into());
        }

        let key = ObjectKey::new(meta, &pk);
        let handle = match self.identity_map.get(&key) {
            Some(existing) => {
                let entity = self.arena.get_mut(existing)?;
                if entity.is_initialized() {
                    return Ok(existing);
                }
                entity.load_row(&row);
                existing
            }
            None => {
                let mut entity = Entity::reference(meta, &pk);
                entity.load_row(&row);
                self.arena.insert(entity)
            }
        };

        self.merge_entity(handle, true, &mut HashSet::new())?;
        for rel in meta.relations.iter().filter(|r| r.owns_foreign_key()) {
            if let Some(fk) = row.get(rel.name) {
                self.computer
                    .record(handle, rel.name, PayloadValue::Value(fk.clone()));
            }
        }
        Ok(handle)
    }

    /// Register `entity` in the identity map and snapshot it if it has no
    /// snapshot yet, cascading to relations marked for merge.
    ///
    /// Entities without a primary key cannot be mapped; merging them is a
    /// silent no-op.
    pub fn merge(&mut self, entity: EntityHandle) -> Result<()> {
        self.merge_entity(entity, false, &mut HashSet::new())
    }

    /// Like [`merge`](Self::merge), but always takes a fresh snapshot.
    pub fn refresh_snapshot(&mut self, entity: EntityHandle) -> Result<()> {
        self.merge_entity(entity, true, &mut HashSet::new())
    }

    fn merge_entity(
        &mut self,
        handle: EntityHandle,
        refresh: bool,
        visited: &mut HashSet<EntityHandle>,
    ) -> Result<()> {
        if !visited.insert(handle) {
            return Ok(());
        }
        let entity = self.arena.get(handle)?;
        let meta = entity.meta();
        let Some(pk) = entity.primary_key() else {
            return Ok(());
        };
        let initialized = entity.is_initialized();

        let key = ObjectKey::new(meta, &pk);
        if let Some(previous) = self.identity_map.insert(key, handle) {
            if previous != handle {
                tracing::debug!(entity = %handle, replaced = %previous, "Identity map entry replaced");
            }
        }
        if initialized && (refresh || !self.computer.has_snapshot(handle)) {
            self.computer.take_snapshot(&self.arena, handle)?;
        }

        for (idx, rel) in meta.relations.iter().enumerate() {
            if rel.cascades(Cascade::Merge) {
                for target in self.arena.get(handle)?.targets(idx) {
                    self.merge_entity(target, refresh, visited)?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// The entity mapped to `primary_key`, if any.
    pub fn get_by_id(&self, meta: &EntityMeta, primary_key: &[Value]) -> Option<EntityHandle> {
        self.identity_map.get(&ObjectKey::new(meta, primary_key))
    }

    /// Extract a primary key from `filter` and look it up.
    ///
    /// Returns `None` when no complete key can be extracted.
    pub fn try_get_by_id(&self, meta: &EntityMeta, filter: &KeyFilter) -> Option<EntityHandle> {
        let pk = self.extract_key(meta, filter)?;
        if pk.iter().any(Value::is_null) {
            return None;
        }
        self.get_by_id(meta, &pk)
    }

    fn extract_key(&self, meta: &EntityMeta, filter: &KeyFilter) -> Option<Vec<Value>> {
        let names = meta.primary_key_names();
        match filter {
            KeyFilter::Key(Value::Array(parts)) | KeyFilter::Composite(parts) => {
                (parts.len() == names.len()).then(|| parts.clone())
            }
            KeyFilter::Key(value) => (names.len() == 1).then(|| vec![value.clone()]),
            KeyFilter::Fields(pairs) => {
                if pairs.len() != names.len() {
                    return None;
                }
                names
                    .iter()
                    .map(|name| {
                        pairs
                            .iter()
                            .find(|(field, _)| field == name)
                            .map(|(_, value)| value.clone())
                    })
                    .collect()
            }
            KeyFilter::Entity(handle) => self.arena.get(*handle).ok()?.primary_key(),
        }
    }

    /// Read-only view of the identity map.
    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    /// The last-known persisted state of `entity`.
    pub fn original_data(&self, entity: EntityHandle) -> Option<&Snapshot> {
        self.computer.snapshot(entity)
    }

    pub fn identifier(&self, entity: EntityHandle) -> Option<&EntityIdentifier> {
        self.identifiers.get(entity)
    }

    pub fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            persist: self.persist_queue.len(),
            remove: self.remove_queue.len(),
            orphan: self.orphan_queue.len(),
        }
    }

    /// Whether `entity` is identity-mapped or queued for persist here.
    pub fn is_managed(&self, entity: EntityHandle) -> bool {
        let Ok(e) = self.arena.get(entity) else {
            return false;
        };
        if self.persist_queue.contains(entity) {
            return true;
        }
        e.primary_key()
            .is_some_and(|pk| self.get_by_id(e.meta(), &pk) == Some(entity))
    }

    pub fn is_scheduled_for_removal(&self, entity: EntityHandle) -> bool {
        self.remove_queue.contains(entity) || self.orphan_queue.contains(entity)
    }

    // ========================================================================
    // Intents
    // ========================================================================

    /// Queue `entity` for insertion or update, cascading to relations marked
    /// for persist. Persisting an already queued entity is a no-op.
    pub fn persist(&mut self, entity: EntityHandle) -> Result<()> {
        self.persist_entity(entity, &mut HashSet::new())
    }

    fn persist_entity(
        &mut self,
        handle: EntityHandle,
        visited: &mut HashSet<EntityHandle>,
    ) -> Result<()> {
        if !visited.insert(handle) {
            return Ok(());
        }
        let entity = self.arena.get(handle)?;
        if self.persist_queue.contains(handle) {
            return Ok(());
        }
        let meta = entity.meta();
        if !entity.has_primary_key() {
            self.identifiers.allocate(handle);
        }
        self.persist_queue.push(handle);
        self.remove_queue.remove(handle);
        tracing::debug!(entity = %handle, name = meta.name, "Queued for persist");

        for (idx, rel) in meta.relations.iter().enumerate() {
            if rel.cascades(Cascade::Persist) {
                for target in self.arena.get(handle)?.targets(idx) {
                    self.persist_entity(target, visited)?;
                }
            }
        }
        Ok(())
    }

    /// Queue `entity` for deletion, cascading to relations marked for remove.
    ///
    /// Entities that were never written just leave the persist queue. Written
    /// ones leave the identity map immediately and are deleted on commit.
    pub fn remove(&mut self, entity: EntityHandle) -> Result<()> {
        self.remove_entity(entity, &mut HashSet::new())
    }

    fn remove_entity(
        &mut self,
        handle: EntityHandle,
        visited: &mut HashSet<EntityHandle>,
    ) -> Result<()> {
        if !visited.insert(handle) {
            return Ok(());
        }
        let entity = self.arena.get(handle)?;
        let meta = entity.meta();
        let pk = entity.primary_key();

        self.persist_queue.remove(handle);
        match pk {
            Some(pk) => {
                self.remove_queue.push(handle);
                self.identity_map
                    .remove_entity(&ObjectKey::new(meta, &pk), handle);
                self.computer.forget(handle);
                tracing::debug!(entity = %handle, name = meta.name, "Queued for removal");
            }
            None => {
                self.identifiers.remove(handle);
                tracing::trace!(entity = %handle, "Dropped unpersisted entity");
            }
        }

        for (idx, rel) in meta.relations.iter().enumerate() {
            if rel.cascades(Cascade::Remove) {
                for target in self.arena.get(handle)?.targets(idx) {
                    self.remove_entity(target, visited)?;
                }
            }
        }
        Ok(())
    }

    /// Delete `entity` on the next commit because it was detached from a
    /// relation with orphan removal.
    pub fn schedule_orphan_removal(&mut self, entity: EntityHandle) -> Result<()> {
        self.arena.get(entity)?;
        if self.orphan_queue.push(entity) {
            tracing::trace!(entity = %entity, "Scheduled orphan removal");
        }
        Ok(())
    }

    pub fn cancel_orphan_removal(&mut self, entity: EntityHandle) {
        self.orphan_queue.remove(entity);
    }

    /// Forget every tracked entity and pending intent.
    pub fn clear(&mut self) {
        tracing::debug!(
            mapped = self.identity_map.len(),
            snapshots = self.computer.len(),
            "Clearing unit of work"
        );
        self.identity_map.clear();
        self.computer.clear();
        self.cleanup();
    }

    fn cleanup(&mut self) {
        self.identifiers.clear();
        self.persist_queue.clear();
        self.remove_queue.clear();
        self.orphan_queue.clear();
    }

    /// Register a lifecycle callback for entities named `entity`.
    pub fn on(
        &mut self,
        entity: &'static str,
        event: LifecycleEvent,
        callback: impl FnMut(&mut Entity) -> Result<()> + Send + 'static,
    ) {
        self.hooks.on(entity, event, callback);
    }

    // ========================================================================
    // Relations
    // ========================================================================

    fn relation_of(&self, owner: EntityHandle, relation: &str) -> Result<(usize, &'static RelationInfo)> {
        let entity = self.arena.get(owner)?;
        let idx = entity.relation_index(relation)?;
        Ok((idx, &entity.meta().relations[idx]))
    }

    /// Point a to-one relation at `target`, or clear it.
    pub fn set_reference(
        &mut self,
        owner: EntityHandle,
        relation: &str,
        target: Option<EntityHandle>,
    ) -> Result<()> {
        let (idx, rel) = self.relation_of(owner, relation)?;
        if !rel.kind.is_to_one() {
            return Err(not_to_one(self.arena.get(owner)?.label(owner), rel).into());
        }
        if let Some(t) = target {
            self.arena.get(t)?;
        }
        let previous = match self.arena.get_mut(owner)?.slot_mut(idx) {
            RelationSlot::One(slot) => std::mem::replace(slot, target),
            RelationSlot::Many(_) => None,
        };
        if rel.orphan_removal {
            if let Some(old) = previous.filter(|old| Some(*old) != target) {
                self.schedule_orphan_removal(old)?;
            }
            if let Some(t) = target {
                self.cancel_orphan_removal(t);
            }
        }
        Ok(())
    }

    /// Add `item` to a to-many relation. Returns `false` if already present.
    pub fn add_to_collection(
        &mut self,
        owner: EntityHandle,
        relation: &str,
        item: EntityHandle,
    ) -> Result<bool> {
        let (idx, rel) = self.relation_of(owner, relation)?;
        self.arena.get(item)?;
        let added = self.collection_mut(owner, idx, rel)?.add(item);
        if rel.orphan_removal {
            self.cancel_orphan_removal(item);
        }
        Ok(added)
    }

    /// Remove `item` from a to-many relation. Returns `false` if absent.
    pub fn remove_from_collection(
        &mut self,
        owner: EntityHandle,
        relation: &str,
        item: EntityHandle,
    ) -> Result<bool> {
        let (idx, rel) = self.relation_of(owner, relation)?;
        let removed = self.collection_mut(owner, idx, rel)?.remove(item);
        if removed && rel.orphan_removal {
            self.schedule_orphan_removal(item)?;
        }
        Ok(removed)
    }

    /// Replace a to-many relation with loaded items. The collection is clean.
    pub fn initialize_collection(
        &mut self,
        owner: EntityHandle,
        relation: &str,
        items: Vec<EntityHandle>,
    ) -> Result<()> {
        let (idx, rel) = self.relation_of(owner, relation)?;
        for item in &items {
            self.arena.get(*item)?;
        }
        let label = self.arena.get(owner)?.label(owner);
        match self.arena.get_mut(owner)?.slot_mut(idx) {
            RelationSlot::Many(coll) => {
                *coll = Some(Collection::from_items(items));
                Ok(())
            }
            RelationSlot::One(_) => Err(not_to_many(label, rel).into()),
        }
    }

    fn collection_mut(
        &mut self,
        owner: EntityHandle,
        idx: usize,
        rel: &RelationInfo,
    ) -> Result<&mut Collection> {
        let label = self.arena.get(owner)?.label(owner);
        match self.arena.get_mut(owner)?.slot_mut(idx) {
            RelationSlot::Many(Some(coll)) => Ok(coll),
            RelationSlot::Many(None) => {
                Err(ValidationError::collection_not_initialized(label, rel.name).into())
            }
            RelationSlot::One(_) => Err(not_to_many(label, rel).into()),
        }
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Load a reference's row through `ops` and snapshot it.
    #[tracing::instrument(level = "debug", skip(self, cx, ops))]
    pub async fn initialize<O: StorageOps>(
        &mut self,
        cx: &Cx,
        ops: &O,
        entity: EntityHandle,
    ) -> Outcome<(), Error> {
        let (name, identity, label) = match self.row_identity(entity) {
            Ok(Some(found)) => found,
            Ok(None) => return Outcome::Ok(()),
            Err(e) => return Outcome::Err(e),
        };
        let row = match ops.fetch(cx, name, &identity).await {
            Outcome::Ok(Some(row)) => row,
            Outcome::Ok(None) => {
                return Outcome::Err(
                    StorageError::new(StorageErrorKind::NotFound, format!("{label} not found"))
                        .into(),
                );
            }
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let meta = match self.arena.get_mut(entity) {
            Ok(e) => {
                e.load_row(&row);
                e.meta()
            }
            Err(e) => return Outcome::Err(e),
        };
        if let Err(e) = self.merge_entity(entity, true, &mut HashSet::new()) {
            return Outcome::Err(e);
        }
        for rel in meta.relations.iter().filter(|r| r.owns_foreign_key()) {
            if let Some(fk) = row.get(rel.name) {
                self.computer
                    .record(entity, rel.name, PayloadValue::Value(fk.clone()));
            }
        }
        tracing::debug!(entity = %label, "Initialized reference");
        Outcome::Ok(())
    }

    /// Identity of an uninitialized entity's row, or `None` if it is loaded.
    fn row_identity(
        &self,
        entity: EntityHandle,
    ) -> Result<Option<(&'static str, RowIdentity, EntityLabel)>> {
        let e = self.arena.get(entity)?;
        if e.is_initialized() {
            return Ok(None);
        }
        let label = e.label(entity);
        let pk = e
            .primary_key()
            .ok_or_else(|| Error::from(ValidationError::missing_primary_key(label.clone())))?;
        let identity = RowIdentity::new(e.meta().primary_key_names().into_iter().zip(pk).collect());
        Ok(Some((e.name(), identity, label)))
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Compute the batch a commit would dispatch without dispatching it.
    ///
    /// The unit of work is left exactly as it was.
    pub fn preview(&mut self) -> Result<CommitPlan> {
        let checkpoint = self.checkpoint();
        let plan = self.compute_plan();
        self.restore(checkpoint);
        plan
    }

    /// Write every pending change through `storage`.
    ///
    /// A non-empty batch runs inside a transaction when implicit transactions
    /// are enabled, the port supports them and none is open yet. On failure
    /// that transaction is rolled back and the configured [`FailurePolicy`]
    /// decides what state the unit of work is left in. Without a transaction
    /// of its own, writes that storage already applied are kept.
    #[tracing::instrument(level = "debug", skip(self, cx, storage), fields(session = self.arena.session()))]
    pub async fn commit<P: StoragePort>(
        &mut self,
        cx: &Cx,
        storage: &P,
    ) -> Outcome<CommitReport, Error> {
        let checkpoint = self.checkpoint();
        let plan = match self.compute_plan() {
            Ok(plan) => plan,
            Err(e) => {
                self.abort(checkpoint);
                return Outcome::Err(e);
            }
        };
        if plan.is_empty() {
            tracing::debug!("Nothing to commit");
            self.cleanup();
            return Outcome::Ok(CommitReport::default());
        }

        let use_transaction = self.config.implicit_transactions
            && !storage.is_in_transaction()
            && storage.supports_transactions();
        let planned = plan.planned();
        let mut report = CommitReport::default();

        if !use_transaction {
            let outcome = self.dispatch(cx, storage, plan, &mut report).await;
            return self.finish(checkpoint, outcome, report, &planned, false);
        }

        let tx = match storage.begin(cx).await {
            Outcome::Ok(tx) => tx,
            Outcome::Err(e) => {
                self.abort(checkpoint);
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.abort(checkpoint);
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.abort(checkpoint);
                return Outcome::Panicked(p);
            }
        };
        let outcome = match self.dispatch(cx, &tx, plan, &mut report).await {
            Outcome::Ok(()) => tx.commit(cx).await,
            failure => {
                match tx.rollback(cx).await {
                    Outcome::Ok(()) => tracing::debug!("Rolled back failed commit"),
                    Outcome::Err(e) => {
                        tracing::warn!(error = %e, "Rollback failed after commit error");
                    }
                    Outcome::Cancelled(r) => {
                        tracing::warn!(reason = ?r, "Rollback cancelled after commit error");
                    }
                    Outcome::Panicked(p) => {
                        tracing::warn!(panic = ?p, "Rollback panicked after commit error");
                    }
                }
                failure
            }
        };
        self.finish(checkpoint, outcome, report, &planned, true)
    }

    /// Write every pending change through a transaction (or connection)
    /// the caller manages. No transaction is opened or closed here, so
    /// writes applied before a failure are kept as written.
    #[tracing::instrument(level = "debug", skip(self, cx, ops), fields(session = self.arena.session()))]
    pub async fn commit_in<O: StorageOps>(
        &mut self,
        cx: &Cx,
        ops: &O,
    ) -> Outcome<CommitReport, Error> {
        let checkpoint = self.checkpoint();
        let plan = match self.compute_plan() {
            Ok(plan) => plan,
            Err(e) => {
                self.abort(checkpoint);
                return Outcome::Err(e);
            }
        };
        if plan.is_empty() {
            tracing::debug!("Nothing to commit");
            self.cleanup();
            return Outcome::Ok(CommitReport::default());
        }
        let planned = plan.planned();
        let mut report = CommitReport::default();
        let outcome = self.dispatch(cx, ops, plan, &mut report).await;
        self.finish(checkpoint, outcome, report, &planned, false)
    }

    /// Settle the unit of work after dispatch. `rolled_back` tells whether
    /// the writes in `report` were undone by a transaction this commit owned.
    fn finish(
        &mut self,
        checkpoint: Checkpoint,
        outcome: Outcome<(), Error>,
        report: CommitReport,
        planned: &[EntityHandle],
        rolled_back: bool,
    ) -> Outcome<CommitReport, Error> {
        let failure = match outcome {
            Outcome::Ok(()) => {
                tracing::debug!(
                    creates = report.creates(),
                    updates = report.updates(),
                    deletes = report.deletes(),
                    "Commit complete"
                );
                self.cleanup();
                return Outcome::Ok(report);
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        };

        if rolled_back || report.is_empty() {
            self.abort(checkpoint);
        } else {
            tracing::warn!(
                applied = report.applied.len(),
                "Commit failed without its own transaction, keeping applied writes"
            );
            self.keep_applied(&checkpoint, planned, &report);
            if self.config.failure_policy == FailurePolicy::Discard {
                self.cleanup();
            }
        }
        failure
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            arena: self.arena.clone(),
            computer: self.computer.clone(),
            identity_map: self.identity_map.clone(),
            identifiers: self.identifiers.clone(),
            persist_queue: self.persist_queue.clone(),
            remove_queue: self.remove_queue.clone(),
            orphan_queue: self.orphan_queue.clone(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.arena = checkpoint.arena;
        self.computer = checkpoint.computer;
        self.identity_map = checkpoint.identity_map;
        self.identifiers = checkpoint.identifiers;
        self.persist_queue = checkpoint.persist_queue;
        self.remove_queue = checkpoint.remove_queue;
        self.orphan_queue = checkpoint.orphan_queue;
    }

    fn abort(&mut self, checkpoint: Checkpoint) {
        match self.config.failure_policy {
            FailurePolicy::Restore => {
                tracing::debug!("Commit failed, restoring pre-commit state");
                self.restore(checkpoint);
            }
            FailurePolicy::Discard => {
                tracing::debug!("Commit failed, discarding pending intents");
                // field values written by dispatch stay; relations detached
                // for extra updates come back from the checkpoint
                self.arena.restore_relations(&checkpoint.arena);
                self.computer = checkpoint.computer;
                self.identity_map = checkpoint.identity_map;
                self.cleanup();
            }
        }
    }

    /// Reconcile with storage after a failure that left earlier writes in
    /// place: written entities keep their keys and snapshots, everything the
    /// commit did not get to stays queued.
    fn keep_applied(
        &mut self,
        checkpoint: &Checkpoint,
        planned: &[EntityHandle],
        report: &CommitReport,
    ) {
        let mut written = HashSet::new();
        let mut deleted = HashSet::new();
        for applied in &report.applied {
            match applied.kind {
                ChangeSetKind::Delete => deleted.insert(applied.entity),
                ChangeSetKind::Create | ChangeSetKind::Update => written.insert(applied.entity),
            };
        }

        self.arena.restore_unsettled_relations(&checkpoint.arena, &written);
        for handle in planned {
            if !written.contains(handle) {
                self.computer.restore_snapshot(&checkpoint.computer, *handle);
            }
        }
        self.identifiers.retain_pending();

        self.remove_queue.retain(|h| !deleted.contains(&h));
        let unmet: HandleQueue = checkpoint
            .persist_queue
            .iter()
            .chain(planned.iter().copied())
            .filter(|h| {
                !written.contains(h) && !deleted.contains(h) && !self.remove_queue.contains(*h)
            })
            .collect();
        self.persist_queue = unmet;
        self.orphan_queue.clear();
    }

    /// Build the ordered batch: walk the persist queue, fold orphans into
    /// removes, and turn removes into deletes.
    fn compute_plan(&mut self) -> Result<CommitPlan> {
        for orphan in std::mem::take(&mut self.orphan_queue).to_vec() {
            self.remove_entity(orphan, &mut HashSet::new())?;
        }

        for handle in self.identity_map.handles() {
            if !self.remove_queue.contains(handle) {
                self.persist_queue.push(handle);
            }
        }

        let mut plan = CommitPlan::default();
        let mut visited = HashSet::new();
        for handle in self.persist_queue.to_vec() {
            self.find_new_entities(handle, &mut visited, &mut plan)?;
        }

        for handle in self.remove_queue.iter() {
            let name = self.arena.get(handle)?.name();
            plan.deletes.push(ChangeSet::delete(handle, name));
        }

        tracing::debug!(
            change_sets = plan.change_sets.len(),
            extra_updates = plan.extra_updates.len(),
            deletes = plan.deletes.len(),
            "Computed commit plan"
        );
        Ok(plan)
    }

    /// Whether `target` is part of the current walk but its change set has
    /// not been computed, so its key cannot be known before `owner` is written.
    fn in_flight(&self, target: EntityHandle, visited: &HashSet<EntityHandle>) -> Result<bool> {
        Ok(visited.contains(&target)
            && !self.computer.has_snapshot(target)
            && !self.arena.get(target)?.has_primary_key())
    }

    fn find_new_entities(
        &mut self,
        handle: EntityHandle,
        visited: &mut HashSet<EntityHandle>,
        plan: &mut CommitPlan,
    ) -> Result<()> {
        if !visited.insert(handle) {
            return Ok(());
        }
        let entity = self.arena.get(handle)?;
        if !entity.is_initialized()
            || self.remove_queue.contains(handle)
            || self.orphan_queue.contains(handle)
        {
            return Ok(());
        }
        if !entity.has_primary_key() {
            self.identifiers.allocate(handle);
        }
        let meta = entity.meta();
        // items of inverse collections reference this entity, so they are
        // walked once its change set exists
        let mut dependents = Vec::new();

        for (idx, rel) in meta.relations.iter().enumerate() {
            if rel.kind.is_to_one() {
                let target = match self.arena.get(handle)?.slot(idx) {
                    RelationSlot::One(Some(target)) => *target,
                    _ => continue,
                };
                if rel.owns_foreign_key() && self.in_flight(target, visited)? {
                    if let RelationSlot::One(slot) = self.arena.get_mut(handle)?.slot_mut(idx) {
                        *slot = None;
                    }
                    tracing::trace!(owner = %handle, relation = rel.name, target = %target, "Deferred reference");
                    plan.extra_updates.push(ExtraUpdate::Reference {
                        owner: handle,
                        relation: rel.name,
                        target,
                    });
                    continue;
                }
                self.find_new_entities(target, visited, plan)?;
            } else {
                let items = match self.arena.get(handle)?.slot(idx) {
                    RelationSlot::Many(Some(coll)) => coll.items().to_vec(),
                    _ => continue,
                };
                if !rel.owns_collection() {
                    dependents.extend(items);
                    continue;
                }
                let mut deferred = false;
                for item in &items {
                    if self.in_flight(*item, visited)? {
                        deferred = true;
                        break;
                    }
                }
                if deferred {
                    let mut taken = Vec::new();
                    if let RelationSlot::Many(Some(coll)) =
                        self.arena.get_mut(handle)?.slot_mut(idx)
                    {
                        taken = coll.take_items();
                    }
                    tracing::trace!(owner = %handle, relation = rel.name, items = taken.len(), "Deferred collection");
                    plan.extra_updates.push(ExtraUpdate::Collection {
                        owner: handle,
                        relation: rel.name,
                        items: taken,
                    });
                }
                for item in items {
                    if !self.computer.has_snapshot(item) {
                        self.find_new_entities(item, visited, plan)?;
                    }
                }
            }
        }

        if let Some(change_set) = self.computer.compute(&mut self.arena, handle)? {
            plan.change_sets.push(change_set);
            self.persist_queue.remove(handle);
            self.computer.take_snapshot(&self.arena, handle)?;
        }

        for item in dependents {
            if !self.computer.has_snapshot(item) {
                self.find_new_entities(item, visited, plan)?;
            }
        }
        Ok(())
    }

    async fn dispatch<O: StorageOps>(
        &mut self,
        cx: &Cx,
        ops: &O,
        plan: CommitPlan,
        report: &mut CommitReport,
    ) -> Outcome<(), Error> {
        tracing::debug!(writes = plan.len(), "Dispatching commit plan");

        for change_set in plan.change_sets {
            match self.apply(cx, ops, change_set, true).await {
                Outcome::Ok(applied) => report.applied.push(applied),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for extra in plan.extra_updates {
            let change_set = match self.restore_deferred(extra) {
                Ok(change_set) => change_set,
                Err(e) => return Outcome::Err(e),
            };
            match self.apply(cx, ops, change_set, false).await {
                Outcome::Ok(applied) => report.applied.push(applied),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for change_set in plan.deletes {
            match self.apply(cx, ops, change_set, true).await {
                Outcome::Ok(applied) => report.applied.push(applied),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        Outcome::Ok(())
    }

    /// Put a deferred relation back on its owner and build the UPDATE that
    /// writes it.
    fn restore_deferred(&mut self, extra: ExtraUpdate) -> Result<ChangeSet> {
        let owner = extra.owner();
        let relation = extra.relation();
        let idx = self.arena.get(owner)?.relation_index(relation)?;
        let value = match extra {
            ExtraUpdate::Reference { target, .. } => {
                if let RelationSlot::One(slot) = self.arena.get_mut(owner)?.slot_mut(idx) {
                    *slot = Some(target);
                }
                identity_of(&self.arena, target)?
            }
            ExtraUpdate::Collection { items, .. } => {
                let identities = items
                    .iter()
                    .map(|item| identity_of(&self.arena, *item))
                    .collect::<Result<Vec<_>>>()?;
                if let RelationSlot::Many(slot) = self.arena.get_mut(owner)?.slot_mut(idx) {
                    *slot = Some(Collection::from_items(items));
                }
                PayloadValue::List(identities)
            }
        };
        let name = self.arena.get(owner)?.name();
        let mut change_set = ChangeSet::new(owner, name, ChangeSetKind::Update, Default::default());
        change_set.payload.insert(relation, value);
        change_set.original = self.computer.snapshot(owner).cloned();
        Ok(change_set)
    }

    /// Dispatch one change set with its lifecycle callbacks, then reconcile
    /// the identity map and snapshot.
    async fn apply<O: StorageOps>(
        &mut self,
        cx: &Cx,
        ops: &O,
        mut change_set: ChangeSet,
        fire_hooks: bool,
    ) -> Outcome<AppliedChangeSet, Error> {
        let handle = change_set.entity;
        let kind = change_set.kind;

        if fire_hooks {
            if let Err(e) = self.run_before_hooks(&mut change_set) {
                return Outcome::Err(e);
            }
        }

        let payload = match ChangeSetPersister::new(ops)
            .persist(cx, &mut self.arena, &mut self.identifiers, &change_set)
            .await
        {
            Outcome::Ok(payload) => payload,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        if let Err(e) = self.reconcile(handle, kind) {
            return Outcome::Err(e);
        }

        if fire_hooks {
            let fired = self
                .arena
                .get_mut(handle)
                .and_then(|entity| self.hooks.fire(LifecycleEvent::after(kind), entity));
            if let Err(e) = fired {
                return Outcome::Err(e);
            }
        }

        Outcome::Ok(AppliedChangeSet {
            entity: handle,
            name: change_set.name,
            kind,
            payload,
        })
    }

    /// Fire "before" callbacks and fold whatever they changed into the payload.
    fn run_before_hooks(&mut self, change_set: &mut ChangeSet) -> Result<()> {
        let event = LifecycleEvent::before(change_set.kind);
        if !self.hooks.has(change_set.name, event) {
            return Ok(());
        }
        let handle = change_set.entity;
        self.hooks.fire(event, self.arena.get_mut(handle)?)?;
        if change_set.kind == ChangeSetKind::Delete {
            return Ok(());
        }

        let current = ChangeSetComputer::prepare(&self.arena, handle)?;
        let changed = match self.computer.snapshot(handle) {
            Some(snapshot) => diff(snapshot, current),
            None => current,
        };
        if !changed.is_empty() {
            tracing::trace!(entity = %handle, fields = changed.len(), "Folding callback changes into payload");
        }
        change_set.payload.extend(changed);
        Ok(())
    }

    fn reconcile(&mut self, handle: EntityHandle, kind: ChangeSetKind) -> Result<()> {
        let entity = self.arena.get(handle)?;
        let meta = entity.meta();
        let pk = entity.primary_key();
        match kind {
            ChangeSetKind::Create | ChangeSetKind::Update => {
                if let Some(pk) = pk {
                    self.identity_map.insert(ObjectKey::new(meta, &pk), handle);
                }
                self.computer.take_snapshot(&self.arena, handle)
            }
            ChangeSetKind::Delete => {
                if let Some(pk) = pk {
                    self.identity_map
                        .remove_entity(&ObjectKey::new(meta, &pk), handle);
                }
                self.computer.forget(handle);
                self.identifiers.remove(handle);
                Ok(())
            }
        }
    }
}

fn not_to_one(label: EntityLabel, rel: &RelationInfo) -> ValidationError {
    ValidationError::new(
        ValidationErrorKind::InvalidPayload,
        format!("relation '{}' is not a to-one relation", rel.name),
    )
    .with_entity(label)
}

fn not_to_many(label: EntityLabel, rel: &RelationInfo) -> ValidationError {
    ValidationError::new(
        ValidationErrorKind::InvalidPayload,
        format!("relation '{}' is not a to-many relation", rel.name),
    )
    .with_entity(label)
}
