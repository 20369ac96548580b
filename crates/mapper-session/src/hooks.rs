//! Entity lifecycle callbacks.

use crate::change_set::ChangeSetKind;
use crate::entity::Entity;
use mapper_core::Result;
use std::collections::HashMap;

/// Type alias for lifecycle callbacks.
///
/// Callbacks receive the entity being written and may mutate it; "before"
/// mutations are folded into the pending payload. Returning `Err` aborts the
/// commit.
pub type LifecycleCallback = Box<dyn FnMut(&mut Entity) -> Result<()> + Send>;

/// Points in a change set's dispatch where callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
}

impl LifecycleEvent {
    /// The event fired before dispatching a change set of `kind`.
    pub const fn before(kind: ChangeSetKind) -> Self {
        match kind {
            ChangeSetKind::Create => LifecycleEvent::BeforeCreate,
            ChangeSetKind::Update => LifecycleEvent::BeforeUpdate,
            ChangeSetKind::Delete => LifecycleEvent::BeforeDelete,
        }
    }

    /// The event fired after a change set of `kind` was applied.
    pub const fn after(kind: ChangeSetKind) -> Self {
        match kind {
            ChangeSetKind::Create => LifecycleEvent::AfterCreate,
            ChangeSetKind::Update => LifecycleEvent::AfterUpdate,
            ChangeSetKind::Delete => LifecycleEvent::AfterDelete,
        }
    }
}

/// Callbacks registered for one entity type.
#[derive(Default)]
pub struct EntityHooks {
    before_create: Vec<LifecycleCallback>,
    after_create: Vec<LifecycleCallback>,
    before_update: Vec<LifecycleCallback>,
    after_update: Vec<LifecycleCallback>,
    before_delete: Vec<LifecycleCallback>,
    after_delete: Vec<LifecycleCallback>,
}

impl std::fmt::Debug for EntityHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityHooks")
            .field("before_create", &self.before_create.len())
            .field("after_create", &self.after_create.len())
            .field("before_update", &self.before_update.len())
            .field("after_update", &self.after_update.len())
            .field("before_delete", &self.before_delete.len())
            .field("after_delete", &self.after_delete.len())
            .finish()
    }
}

impl EntityHooks {
    fn callbacks(&mut self, event: LifecycleEvent) -> &mut Vec<LifecycleCallback> {
        match event {
            LifecycleEvent::BeforeCreate => &mut self.before_create,
            LifecycleEvent::AfterCreate => &mut self.after_create,
            LifecycleEvent::BeforeUpdate => &mut self.before_update,
            LifecycleEvent::AfterUpdate => &mut self.after_update,
            LifecycleEvent::BeforeDelete => &mut self.before_delete,
            LifecycleEvent::AfterDelete => &mut self.after_delete,
        }
    }

    fn fire(&mut self, event: LifecycleEvent, entity: &mut Entity) -> Result<()> {
        for cb in self.callbacks(event).iter_mut() {
            cb(entity)?;
        }
        Ok(())
    }
}

/// Lifecycle callbacks keyed by entity type name.
#[derive(Debug, Default)]
pub struct HookRegistry {
    by_entity: HashMap<&'static str, EntityHooks>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for `event` on entities named `entity`.
    pub fn on(
        &mut self,
        entity: &'static str,
        event: LifecycleEvent,
        callback: impl FnMut(&mut Entity) -> Result<()> + Send + 'static,
    ) {
        self.by_entity
            .entry(entity)
            .or_default()
            .callbacks(event)
            .push(Box::new(callback));
    }

    /// Whether any callback is registered for `event` on `entity`.
    pub fn has(&self, entity: &'static str, event: LifecycleEvent) -> bool {
        self.by_entity.get(entity).is_some_and(|hooks| match event {
            LifecycleEvent::BeforeCreate => !hooks.before_create.is_empty(),
            LifecycleEvent::AfterCreate => !hooks.after_create.is_empty(),
            LifecycleEvent::BeforeUpdate => !hooks.before_update.is_empty(),
            LifecycleEvent::AfterUpdate => !hooks.after_update.is_empty(),
            LifecycleEvent::BeforeDelete => !hooks.before_delete.is_empty(),
            LifecycleEvent::AfterDelete => !hooks.after_delete.is_empty(),
        })
    }

    /// Run every callback registered for `event` on the entity's type.
    pub fn fire(&mut self, event: LifecycleEvent, entity: &mut Entity) -> Result<()> {
        match self.by_entity.get_mut(entity.name()) {
            Some(hooks) => hooks.fire(event, entity),
            None => Ok(()),
        }
    }
}
