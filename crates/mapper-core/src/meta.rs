//! Static entity metadata.
//!
//! Entity types are described once, as `const` items, and shared by every
//! unit of work:
//!
//! ```ignore
//! const AUTHOR_FIELDS: &[FieldInfo] = &[
//!     FieldInfo::new("id", FieldKind::Integer).primary_key(true),
//!     FieldInfo::new("name", FieldKind::Text),
//!     FieldInfo::new("version", FieldKind::Integer).version(true),
//! ];
//! const AUTHOR_RELATIONS: &[RelationInfo] = &[
//!     RelationInfo::new("books", "Book", RelationKind::OneToMany).cascade(&[Cascade::All]),
//! ];
//! pub static AUTHOR: EntityMeta = EntityMeta::new("Author", AUTHOR_FIELDS, AUTHOR_RELATIONS);
//! ```

use crate::value::Value;
use serde::{Deserialize, Serialize};

/// The declared kind of a scalar field, used for payload validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    Integer,
    Float,
    Decimal,
    Text,
    Boolean,
    Date,
    Timestamp,
    Uuid,
    Bytes,
    Json,
    /// Accepts any value
    Any,
}

impl FieldKind {
    /// Name used in validation messages.
    pub const fn name(&self) -> &'static str {
        match self {
            FieldKind::Integer => "INTEGER",
            FieldKind::Float => "DOUBLE",
            FieldKind::Decimal => "DECIMAL",
            FieldKind::Text => "TEXT",
            FieldKind::Boolean => "BOOLEAN",
            FieldKind::Date => "DATE",
            FieldKind::Timestamp => "TIMESTAMP",
            FieldKind::Uuid => "UUID",
            FieldKind::Bytes => "BLOB",
            FieldKind::Json => "JSON",
            FieldKind::Any => "ANY",
        }
    }

    /// Whether `value` already has this kind. NULL is accepted by every kind;
    /// nullability is checked separately.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (FieldKind::Any, _)
                | (FieldKind::Integer, Value::Int(_) | Value::BigInt(_))
                | (FieldKind::Float, Value::Double(_))
                | (FieldKind::Decimal, Value::Decimal(_))
                | (FieldKind::Text, Value::Text(_))
                | (FieldKind::Boolean, Value::Bool(_))
                | (FieldKind::Date, Value::Date(_))
                | (FieldKind::Timestamp, Value::Timestamp(_))
                | (FieldKind::Uuid, Value::Uuid(_))
                | (FieldKind::Bytes, Value::Bytes(_))
                | (FieldKind::Json, _)
        )
    }

    /// Convert `value` to this kind when the conversion is lossless.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (FieldKind::Integer, Value::Text(s)) => s.trim().parse::<i64>().ok().map(Value::BigInt),
            (FieldKind::Integer, Value::Double(d)) if d.fract() == 0.0 && d.is_finite() => {
                Some(Value::BigInt(*d as i64))
            }
            (FieldKind::Float, Value::Int(_) | Value::BigInt(_) | Value::Decimal(_)) => {
                value.as_f64().map(Value::Double)
            }
            (FieldKind::Float, Value::Text(s)) => s.trim().parse::<f64>().ok().map(Value::Double),
            (FieldKind::Decimal, Value::Int(_) | Value::BigInt(_)) => {
                value.as_i64().map(|v| Value::Decimal(v.to_string()))
            }
            (FieldKind::Decimal, Value::Double(d)) => Some(Value::Decimal(d.to_string())),
            (FieldKind::Decimal, Value::Text(s)) if s.trim().parse::<f64>().is_ok() => {
                Some(Value::Decimal(s.trim().to_string()))
            }
            (FieldKind::Boolean, Value::Int(_) | Value::BigInt(_)) => match value.as_i64() {
                Some(0) => Some(Value::Bool(false)),
                Some(1) => Some(Value::Bool(true)),
                _ => None,
            },
            (FieldKind::Boolean, Value::Text(s)) => match s.as_str() {
                "true" | "1" => Some(Value::Bool(true)),
                "false" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            (FieldKind::Timestamp, Value::Int(_) | Value::BigInt(_)) => {
                value.as_i64().map(Value::Timestamp)
            }
            _ => None,
        }
    }
}

/// Metadata about an entity field.
#[derive(Debug, Clone, Copy)]
pub struct FieldInfo {
    /// Field name (also the payload key)
    pub name: &'static str,
    /// Declared kind, used for validation
    pub kind: FieldKind,
    /// Whether this field may hold NULL
    pub nullable: bool,
    /// Whether this field is (part of) the primary key
    pub primary_key: bool,
    /// Whether this field is the optimistic-lock version
    pub version: bool,
    /// Value generated when the entity is first written and the field is NULL
    pub on_create: Option<fn() -> Value>,
    /// Value generated on every write, immediately before dispatch
    pub on_update: Option<fn() -> Value>,
}

impl FieldInfo {
    /// Create a new non-nullable field.
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            nullable: false,
            primary_key: false,
            version: false,
            on_create: None,
            on_update: None,
        }
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    pub const fn version(mut self, value: bool) -> Self {
        self.version = value;
        self
    }

    pub const fn on_create(mut self, generator: fn() -> Value) -> Self {
        self.on_create = Some(generator);
        self
    }

    pub const fn on_update(mut self, generator: fn() -> Value) -> Self {
        self.on_update = Some(generator);
        self
    }

    /// A NULL in this field is acceptable on insert: the storage port or a
    /// generator supplies the value.
    pub fn is_generated(&self) -> bool {
        self.primary_key || self.version || self.on_create.is_some() || self.on_update.is_some()
    }
}

/// The kind of relationship between two entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    /// Many-to-one: the declaring side holds the foreign key
    ManyToOne,
    /// One-to-one: the owning side holds the foreign key
    OneToOne,
    /// One-to-many: inverse side of a many-to-one
    OneToMany,
    /// Many-to-many: the owning side carries the identity list
    ManyToMany,
}

impl RelationKind {
    pub const fn is_to_one(&self) -> bool {
        matches!(self, RelationKind::ManyToOne | RelationKind::OneToOne)
    }

    pub const fn is_to_many(&self) -> bool {
        matches!(self, RelationKind::OneToMany | RelationKind::ManyToMany)
    }
}

/// Which intents propagate across a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cascade {
    Persist,
    Merge,
    Remove,
    All,
}

/// Metadata about a relation.
#[derive(Debug, Clone, Copy)]
pub struct RelationInfo {
    /// Relation name (also the payload key for owning sides)
    pub name: &'static str,
    /// Target entity name
    pub target: &'static str,
    pub kind: RelationKind,
    /// Whether this side owns the foreign key or identity list
    pub owner: bool,
    /// Intents to propagate to the related entities
    pub cascade: &'static [Cascade],
    /// Delete former targets once they are detached from this relation
    pub orphan_removal: bool,
}

impl RelationInfo {
    /// Create a relation. Many-to-one relations own their foreign key;
    /// every other kind is inverse until marked with [`owner`](Self::owner).
    pub const fn new(name: &'static str, target: &'static str, kind: RelationKind) -> Self {
        Self {
            name,
            target,
            kind,
            owner: matches!(kind, RelationKind::ManyToOne),
            cascade: &[],
            orphan_removal: false,
        }
    }

    pub const fn owner(mut self, value: bool) -> Self {
        self.owner = value;
        self
    }

    pub const fn cascade(mut self, cascade: &'static [Cascade]) -> Self {
        self.cascade = cascade;
        self
    }

    pub const fn orphan_removal(mut self, value: bool) -> Self {
        self.orphan_removal = value;
        self
    }

    /// Whether this side stores the target's key in its own payload.
    pub const fn owns_foreign_key(&self) -> bool {
        match self.kind {
            RelationKind::ManyToOne => true,
            RelationKind::OneToOne => self.owner,
            _ => false,
        }
    }

    /// Whether this side stores the list of target identities.
    pub const fn owns_collection(&self) -> bool {
        matches!(self.kind, RelationKind::ManyToMany) && self.owner
    }

    /// Whether `intent` propagates across this relation.
    pub fn cascades(&self, intent: Cascade) -> bool {
        if intent == Cascade::Remove && self.orphan_removal {
            return true;
        }
        self.cascade.contains(&intent) || self.cascade.contains(&Cascade::All)
    }
}

/// Static description of an entity type.
#[derive(Debug)]
pub struct EntityMeta {
    /// Entity type name
    pub name: &'static str,
    /// Root of the inheritance hierarchy, if this type extends another.
    /// Identity keys are scoped by the root name.
    pub root: Option<&'static str>,
    pub fields: &'static [FieldInfo],
    pub relations: &'static [RelationInfo],
    /// Read-only entities never produce change sets
    pub readonly: bool,
}

impl EntityMeta {
    pub const fn new(
        name: &'static str,
        fields: &'static [FieldInfo],
        relations: &'static [RelationInfo],
    ) -> Self {
        Self {
            name,
            root: None,
            fields,
            relations,
            readonly: false,
        }
    }

    pub const fn root(mut self, root: &'static str) -> Self {
        self.root = Some(root);
        self
    }

    pub const fn readonly(mut self, value: bool) -> Self {
        self.readonly = value;
        self
    }

    /// Name identity keys are scoped by.
    pub fn root_name(&self) -> &'static str {
        self.root.unwrap_or(self.name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationInfo> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn relation_index(&self, name: &str) -> Option<usize> {
        self.relations.iter().position(|r| r.name == name)
    }

    /// Indices of the primary key fields, in declaration order.
    pub fn primary_key_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.primary_key)
            .map(|(i, _)| i)
    }

    /// Names of the primary key fields.
    pub fn primary_key_names(&self) -> Vec<&'static str> {
        self.fields
            .iter()
            .filter(|f| f.primary_key)
            .map(|f| f.name)
            .collect()
    }

    /// Index of the version field, if the type is versioned.
    pub fn version_index(&self) -> Option<usize> {
        self.fields.iter().position(|f| f.version)
    }

    pub fn version_field(&self) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.version)
    }
}
