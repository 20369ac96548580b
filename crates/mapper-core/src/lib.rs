//! Core types and traits for the mapper unit of work.
//!
//! This crate provides the foundational abstractions shared by the session layer:
//!
//! - `Value` for dynamically typed field values
//! - `EntityMeta`, `FieldInfo` and `RelationInfo` for static entity metadata
//! - `EntityHandle` for arena-backed entity identity
//! - `StoragePort` traits for the backend the unit of work writes through
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod error;
pub mod handle;
pub mod meta;
pub mod storage;
pub mod value;

pub use error::{
    EntityLabel, Error, FieldErrorKind, FieldValidationError, LockError, LockErrorKind, Result,
    StorageError, StorageErrorKind, TransactionError, TransactionErrorKind, ValidationError,
    ValidationErrorKind,
};
pub use handle::EntityHandle;
pub use meta::{Cascade, EntityMeta, FieldInfo, FieldKind, RelationInfo, RelationKind};
pub use storage::{
    LockMode, Payload, RowIdentity, StorageOps, StoragePort, StorageTransaction,
};
pub use value::Value;
