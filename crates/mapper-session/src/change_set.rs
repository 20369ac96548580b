//! Change sets: the computed write for one entity.

use mapper_core::{EntityHandle, Payload, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A payload or snapshot value that may still reference an entity whose
/// primary key is unknown.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    /// A concrete value
    Value(Value),
    /// The primary key of this entity, once its insert has run
    Identifier(EntityHandle),
    /// Identities of a to-many owning relation
    List(Vec<PayloadValue>),
}

impl PayloadValue {
    /// Field-level equality used for diffing.
    pub fn semantic_eq(&self, other: &PayloadValue) -> bool {
        match (self, other) {
            (PayloadValue::Value(a), PayloadValue::Value(b)) => a.semantic_eq(b),
            (PayloadValue::Identifier(a), PayloadValue::Identifier(b)) => a == b,
            (PayloadValue::List(a), PayloadValue::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.semantic_eq(y))
            }
            _ => false,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            PayloadValue::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Whether a placeholder appears anywhere in this value.
    pub fn has_identifier(&self) -> bool {
        match self {
            PayloadValue::Value(_) => false,
            PayloadValue::Identifier(_) => true,
            PayloadValue::List(items) => items.iter().any(PayloadValue::has_identifier),
        }
    }
}

impl From<Value> for PayloadValue {
    fn from(v: Value) -> Self {
        PayloadValue::Value(v)
    }
}

/// Field -> value map that may hold placeholders.
pub type ChangePayload = BTreeMap<&'static str, PayloadValue>;

/// Last-known persisted field values of an entity.
pub type Snapshot = BTreeMap<&'static str, PayloadValue>;

/// Kind of write a change set performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeSetKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ChangeSetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeSetKind::Create => write!(f, "CREATE"),
            ChangeSetKind::Update => write!(f, "UPDATE"),
            ChangeSetKind::Delete => write!(f, "DELETE"),
        }
    }
}

/// One pending write.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub entity: EntityHandle,
    /// Entity type name
    pub name: &'static str,
    pub kind: ChangeSetKind,
    pub payload: ChangePayload,
    /// Snapshot the payload was diffed against (updates only)
    pub original: Option<Snapshot>,
}

impl ChangeSet {
    pub fn new(
        entity: EntityHandle,
        name: &'static str,
        kind: ChangeSetKind,
        payload: ChangePayload,
    ) -> Self {
        Self {
            entity,
            name,
            kind,
            payload,
            original: None,
        }
    }

    /// A DELETE change set; deletes carry no payload.
    pub fn delete(entity: EntityHandle, name: &'static str) -> Self {
        Self::new(entity, name, ChangeSetKind::Delete, ChangePayload::new())
    }
}

/// A relation assignment deferred to break an insert-ordering cycle.
///
/// The relation is detached from the owner while the main batch runs and
/// restored, as its own UPDATE, once every referenced insert has happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtraUpdate {
    /// A to-one foreign key
    Reference {
        owner: EntityHandle,
        relation: &'static str,
        target: EntityHandle,
    },
    /// A to-many owning identity list
    Collection {
        owner: EntityHandle,
        relation: &'static str,
        items: Vec<EntityHandle>,
    },
}

impl ExtraUpdate {
    pub fn owner(&self) -> EntityHandle {
        match self {
            ExtraUpdate::Reference { owner, .. } | ExtraUpdate::Collection { owner, .. } => *owner,
        }
    }

    pub fn relation(&self) -> &'static str {
        match self {
            ExtraUpdate::Reference { relation, .. } | ExtraUpdate::Collection { relation, .. } => {
                relation
            }
        }
    }
}

/// The ordered output of the computing phase.
///
/// Dispatch order is `change_sets`, then `extra_updates`, then `deletes`.
#[derive(Debug, Clone, Default)]
pub struct CommitPlan {
    pub change_sets: Vec<ChangeSet>,
    pub extra_updates: Vec<ExtraUpdate>,
    pub deletes: Vec<ChangeSet>,
}

impl CommitPlan {
    pub fn is_empty(&self) -> bool {
        self.change_sets.is_empty() && self.extra_updates.is_empty() && self.deletes.is_empty()
    }

    /// Number of writes the plan will dispatch.
    pub fn len(&self) -> usize {
        self.change_sets.len() + self.extra_updates.len() + self.deletes.len()
    }

    /// Entities with a CREATE or UPDATE in the plan, in dispatch order.
    pub fn planned(&self) -> Vec<EntityHandle> {
        self.change_sets.iter().map(|c| c.entity).collect()
    }

    /// The computed change set for `entity`, if any.
    pub fn find(&self, entity: EntityHandle) -> Option<&ChangeSet> {
        self.change_sets
            .iter()
            .chain(&self.deletes)
            .find(|cs| cs.entity == entity)
    }
}

/// A change set as it was sent to storage.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChangeSet {
    pub entity: EntityHandle,
    pub name: &'static str,
    pub kind: ChangeSetKind,
    /// The resolved payload, including generated values
    pub payload: Payload,
}

/// Every write a successful commit performed, in dispatch order.
#[derive(Debug, Clone, Default)]
pub struct CommitReport {
    pub applied: Vec<AppliedChangeSet>,
}

impl CommitReport {
    pub fn len(&self) -> usize {
        self.applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    pub fn count(&self, kind: ChangeSetKind) -> usize {
        self.applied.iter().filter(|cs| cs.kind == kind).count()
    }

    pub fn creates(&self) -> usize {
        self.count(ChangeSetKind::Create)
    }

    pub fn updates(&self) -> usize {
        self.count(ChangeSetKind::Update)
    }

    pub fn deletes(&self) -> usize {
        self.count(ChangeSetKind::Delete)
    }

    /// Writes applied to one entity.
    pub fn for_entity(&self, entity: EntityHandle) -> Vec<&AppliedChangeSet> {
        self.applied.iter().filter(|cs| cs.entity == entity).collect()
    }
}
