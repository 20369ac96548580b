//! mapper - the transactional core of an object mapper.
//!
//! mapper tracks entity graphs in memory and writes what changed:
//!
//! - One in-memory entity per stored row (identity map)
//! - Minimal CREATE/UPDATE/DELETE change sets diffed against snapshots
//! - Dependency-ordered writes across cyclic graphs, with extra updates for
//!   foreign keys that cannot be known at insert time
//! - Optimistic version checks and pessimistic row locks
//! - One transaction around the whole batch
//!
//! Storage is reached only through [`StoragePort`]; query generation, schema
//! management and row hydration live outside this crate.
//!
//! # Quick Start
//!
//! ```ignore
//! use mapper::prelude::*;
//!
//! const AUTHOR_FIELDS: &[FieldInfo] = &[
//!     FieldInfo::new("id", FieldKind::Integer).primary_key(true),
//!     FieldInfo::new("name", FieldKind::Text),
//! ];
//! static AUTHOR: EntityMeta = EntityMeta::new("Author", AUTHOR_FIELDS, &[]);
//!
//! async fn example(cx: &Cx, storage: &impl StoragePort) -> Result<()> {
//!     let mut uow = UnitOfWork::new();
//!
//!     let author = uow.create(&AUTHOR);
//!     uow.entity_mut(author)?.set("name", "Jon")?;
//!     uow.persist(author)?;
//!
//!     match uow.commit(cx, storage).await {
//!         Outcome::Ok(report) => assert_eq!(report.creates(), 1),
//!         Outcome::Err(e) => return Err(e),
//!         _ => {}
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - **Explicit context**: relation helpers take the unit of work, there is no
//!   ambient "current session"
//! - **Arena-backed graphs**: entities are addressed by copyable handles, so
//!   cycles need no reference counting
//! - **Structured concurrency**: every storage call takes a `Cx` and returns an
//!   asupersync `Outcome`
//! - **Retryable commits**: a failed commit restores the pre-commit state by
//!   default

// Re-export all public types from sub-crates
pub use mapper_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Core types
    Cascade,
    EntityHandle,
    EntityLabel,
    EntityMeta,
    Error,
    FieldErrorKind,
    FieldInfo,
    FieldKind,
    FieldValidationError,
    LockError,
    LockErrorKind,
    LockMode,
    Payload,
    RelationInfo,
    RelationKind,
    Result,
    RowIdentity,
    StorageError,
    StorageErrorKind,
    // Storage port
    StorageOps,
    StoragePort,
    StorageTransaction,
    TransactionError,
    TransactionErrorKind,
    ValidationError,
    ValidationErrorKind,
    Value,
};

// Unit of work
pub use mapper_session::{
    AppliedChangeSet, ChangePayload, ChangeSet, ChangeSetComputer, ChangeSetKind,
    ChangeSetPersister, Collection, CommitPlan, CommitReport, Entity, EntityIdentifier,
    ExtraUpdate, FailurePolicy, HookRegistry, IdentifierMap, IdentityMap, KeyFilter,
    LifecycleCallback, LifecycleEvent, ObjectKey, PayloadValue, PendingCounts, RelationSlot,
    SessionConfig, Snapshot, UnitOfWork,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        // Metadata
        Cascade,
        // Results
        CommitReport,
        // asupersync
        Cx,
        EntityHandle,
        EntityMeta,
        Error,
        FailurePolicy,
        FieldInfo,
        FieldKind,
        KeyFilter,
        LifecycleEvent,
        LockMode,
        Outcome,
        Payload,
        RelationInfo,
        RelationKind,
        Result,
        RowIdentity,
        SessionConfig,
        // Storage port
        StorageOps,
        StoragePort,
        StorageTransaction,
        // Unit of work
        UnitOfWork,
        Value,
    };
}
