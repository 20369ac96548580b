//! Error types for unit of work operations.

use crate::handle::EntityHandle;
use crate::value::Value;
use std::fmt;

/// The primary error type for all unit of work operations.
#[derive(Debug)]
pub enum Error {
    /// Data or usage errors: nothing was persisted, fix the input and retry
    Validation(ValidationError),
    /// Concurrency control failures: someone else won the race
    Lock(LockError),
    /// Errors raised by the storage port
    Storage(StorageError),
    /// Transaction lifecycle errors
    Transaction(TransactionError),
    /// Custom error with message
    Custom(String),
}

/// Names the entity an error is about.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityLabel {
    /// Entity type name
    pub entity: &'static str,
    /// The in-memory entity, when the error was raised by a unit of work
    pub handle: Option<EntityHandle>,
    /// Primary key values, if known
    pub primary_key: Option<Vec<Value>>,
}

impl EntityLabel {
    pub fn new(entity: &'static str) -> Self {
        Self {
            entity,
            handle: None,
            primary_key: None,
        }
    }

    pub fn with_handle(mut self, handle: EntityHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn with_primary_key(mut self, primary_key: Option<Vec<Value>>) -> Self {
        self.primary_key = primary_key;
        self
    }
}

impl fmt::Display for EntityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.primary_key {
            Some(pk) => {
                let parts: Vec<String> = pk.iter().map(Value::key_fragment).collect();
                write!(f, "{}({})", self.entity, parts.join(", "))
            }
            None => write!(f, "{}(<new>)", self.entity),
        }
    }
}

/// Validation error raised before or instead of touching storage.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// What kind of misuse or bad data was detected
    pub kind: ValidationErrorKind,
    /// The entity involved, if any
    pub entity: Option<EntityLabel>,
    /// Human-readable summary
    pub message: String,
    /// Field-level failures for payload validation
    pub errors: Vec<FieldValidationError>,
}

/// The category of a validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Payload values failed type/shape checks
    InvalidPayload,
    /// A to-many relation on a loaded entity was never initialized
    CollectionNotInitialized,
    /// The entity or row has no extractable primary key
    MissingPrimaryKey,
    /// The entity is not tracked by this unit of work
    EntityNotManaged,
    /// A pessimistic lock was requested outside a transaction
    TransactionRequired,
    /// A placeholder key was still pending at dispatch time
    UnresolvedIdentifier,
    /// A field or relation name is not declared by the entity
    UnknownField,
}

/// A single validation error for a field.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    /// The field name that failed validation
    pub field: String,
    /// The kind of validation that failed
    pub kind: FieldErrorKind,
    /// Human-readable error message
    pub message: String,
}

/// The type of field constraint that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldErrorKind {
    /// Value does not match the declared field kind
    Type,
    /// Required field is missing/null
    Required,
    /// Custom validation failed
    Custom,
}

impl ValidationError {
    /// Create a validation error with no field-level detail.
    pub fn new(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity: None,
            message: message.into(),
            errors: Vec::new(),
        }
    }

    /// Create an empty payload validation container for `entity`.
    pub fn invalid_payload(entity: EntityLabel) -> Self {
        Self {
            kind: ValidationErrorKind::InvalidPayload,
            message: format!("invalid payload for {entity}"),
            entity: Some(entity),
            errors: Vec::new(),
        }
    }

    pub fn with_entity(mut self, entity: EntityLabel) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn entity_not_managed(entity: EntityLabel) -> Self {
        Self::new(
            ValidationErrorKind::EntityNotManaged,
            format!("entity {entity} is not managed by this unit of work"),
        )
        .with_entity(entity)
    }

    pub fn missing_primary_key(entity: EntityLabel) -> Self {
        Self::new(
            ValidationErrorKind::MissingPrimaryKey,
            format!("entity {entity} has no primary key"),
        )
        .with_entity(entity)
    }

    pub fn transaction_required() -> Self {
        Self::new(
            ValidationErrorKind::TransactionRequired,
            "an open transaction is required for pessimistic locking",
        )
    }

    pub fn collection_not_initialized(entity: EntityLabel, relation: &str) -> Self {
        Self::new(
            ValidationErrorKind::CollectionNotInitialized,
            format!("collection '{relation}' of {entity} is not initialized"),
        )
        .with_entity(entity)
    }

    pub fn unresolved_identifier(entity: EntityLabel, field: &str) -> Self {
        Self::new(
            ValidationErrorKind::UnresolvedIdentifier,
            format!("field '{field}' of {entity} references an entity that has not been inserted"),
        )
        .with_entity(entity)
    }

    pub fn unknown_field(entity: &'static str, field: &str) -> Self {
        Self::new(
            ValidationErrorKind::UnknownField,
            format!("entity {entity} declares no field or relation '{field}'"),
        )
        .with_entity(EntityLabel::new(entity))
    }

    /// Check if there are any field-level errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add a field validation error.
    pub fn add(
        &mut self,
        field: impl Into<String>,
        kind: FieldErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            kind,
            message: message.into(),
        });
    }

    /// Add a type mismatch error.
    pub fn add_type(&mut self, field: impl Into<String>, expected: &str, actual: &Value) {
        self.add(
            field,
            FieldErrorKind::Type,
            format!("expected {expected}, got {}", actual.type_name()),
        );
    }

    /// Add a required field error.
    pub fn add_required(&mut self, field: impl Into<String>) {
        self.add(field, FieldErrorKind::Required, "is required".to_string());
    }

    /// Add a custom validation error.
    pub fn add_custom(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.add(field, FieldErrorKind::Custom, message);
    }

    /// Convert to Result, returning Ok(()) if no field errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

/// Optimistic locking failure.
#[derive(Debug, Clone)]
pub struct LockError {
    pub kind: LockErrorKind,
    /// The entity that could not be locked or written
    pub entity: EntityLabel,
    /// Version the caller expected
    pub expected: Option<Value>,
    /// Version the entity actually carries
    pub actual: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockErrorKind {
    /// Optimistic locking requested on an entity type without a version field
    NotVersioned,
    /// Caller-supplied version does not match the entity's version
    VersionMismatch,
    /// A versioned write matched no row
    LockFailed,
}

impl LockError {
    pub fn not_versioned(entity: EntityLabel) -> Self {
        Self {
            kind: LockErrorKind::NotVersioned,
            entity,
            expected: None,
            actual: None,
        }
    }

    pub fn version_mismatch(entity: EntityLabel, expected: Value, actual: Value) -> Self {
        Self {
            kind: LockErrorKind::VersionMismatch,
            entity,
            expected: Some(expected),
            actual: Some(actual),
        }
    }

    pub fn lock_failed(entity: EntityLabel, expected: Option<Value>) -> Self {
        Self {
            kind: LockErrorKind::LockFailed,
            entity,
            expected,
            actual: None,
        }
    }
}

/// Error reported by a storage port.
#[derive(Debug)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Connectivity failure
    Connection,
    /// Malformed statement
    Syntax,
    /// Target row or table not found
    NotFound,
    /// Other backend error
    Other,
}

impl StorageError {
    pub fn new(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// The backend cannot run transactions
    NotSupported,
    /// Nested transaction not supported
    NestedNotSupported,
    /// Commit failed
    CommitFailed,
    /// Rollback failed
    RollbackFailed,
}

impl Error {
    /// Is this a validation error ("fix your data and retry")?
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    /// Is this an optimistic lock failure ("someone else won the race")?
    pub fn is_lock_failure(&self) -> bool {
        matches!(self, Error::Lock(_))
    }

    /// Is this a storage error ("storage rejected the write")?
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    /// Kind of a validation error, if this is one.
    pub fn validation_kind(&self) -> Option<ValidationErrorKind> {
        match self {
            Error::Validation(v) => Some(v.kind),
            _ => None,
        }
    }

    /// Kind of a lock error, if this is one.
    pub fn lock_kind(&self) -> Option<LockErrorKind> {
        match self {
            Error::Lock(l) => Some(l.kind),
            _ => None,
        }
    }

    /// The entity this error is about, if known.
    pub fn entity(&self) -> Option<&EntityLabel> {
        match self {
            Error::Validation(v) => v.entity.as_ref(),
            Error::Lock(l) => Some(&l.entity),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Lock(e) => write!(f, "Lock error: {}", e),
            Error::Storage(e) => write!(f, "Storage error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Storage(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => write!(f, "{}", self.message),
            1 => {
                let err = &self.errors[0];
                write!(f, "{}: '{}' {}", self.message, err.field, err.message)
            }
            _ => {
                writeln!(f, "{}:", self.message)?;
                for err in &self.errors {
                    writeln!(f, "  - {}: {}", err.field, err.message)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LockErrorKind::NotVersioned => {
                write!(f, "entity {} is not versioned", self.entity.entity)
            }
            LockErrorKind::VersionMismatch => write!(
                f,
                "version mismatch on {}: expected {}, found {}",
                self.entity,
                self.expected.as_ref().unwrap_or(&Value::Null),
                self.actual.as_ref().unwrap_or(&Value::Null)
            ),
            LockErrorKind::LockFailed => write!(
                f,
                "lock failed on {}: the row was changed or removed concurrently",
                self.entity
            ),
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<LockError> for Error {
    fn from(err: LockError) -> Self {
        Error::Lock(err)
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Storage(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

/// Result type alias for unit of work operations.
pub type Result<T> = std::result::Result<T, Error>;
