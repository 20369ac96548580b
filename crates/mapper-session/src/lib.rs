//! Unit of Work for mapper.
//!
//! `mapper-session` is the **transactional core**. It tracks managed
//! entities, detects what changed since they were last written, and applies
//! the resulting writes through a storage port in dependency order.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: a single in-memory entity per stored row.
//! - **Change sets**: minimal CREATE/UPDATE/DELETE payloads diffed against
//!   snapshots, with placeholders for keys that do not exist yet.
//! - **Commit**: depth-first ordering across cyclic graphs, extra updates for
//!   foreign keys that cannot be written on insert, one transaction around the
//!   whole batch.
//! - **Locking**: optimistic version checks and pessimistic row locks.
//!
//! # Design Philosophy
//!
//! - **Arena ownership**: entities live in the unit of work; callers hold
//!   copyable handles, so cycles need no reference counting.
//! - **Explicit context**: every relation helper takes the unit of work.
//! - **Cancel-correct**: all async operations use `Cx` + `Outcome`.
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new();
//!
//! let author = uow.create(&AUTHOR);
//! uow.entity_mut(author)?.set("name", "Jon")?;
//! uow.persist(author)?;
//!
//! // INSERT, inside a transaction
//! let report = uow.commit(&cx, &storage).await;
//!
//! uow.entity_mut(author)?.set("name", "John")?;
//! // UPDATE with payload {name: "John"}
//! let report = uow.commit(&cx, &storage).await;
//! ```

pub mod change_set;
pub mod computer;
pub mod entity;
pub mod hooks;
pub mod identifier;
pub mod identity_map;
pub mod lock;
pub mod persister;
mod queue;
pub mod unit_of_work;

#[cfg(test)]
mod test_support;

pub use change_set::{
    AppliedChangeSet, ChangePayload, ChangeSet, ChangeSetKind, CommitPlan, CommitReport,
    ExtraUpdate, PayloadValue, Snapshot,
};
pub use computer::ChangeSetComputer;
pub use entity::{Collection, Entity, RelationSlot};
pub use hooks::{HookRegistry, LifecycleCallback, LifecycleEvent};
pub use identifier::{EntityIdentifier, IdentifierMap};
pub use identity_map::{IdentityMap, ObjectKey};
pub use persister::ChangeSetPersister;
pub use unit_of_work::{KeyFilter, UnitOfWork};

use serde::{Deserialize, Serialize};

// ============================================================================
// Configuration
// ============================================================================

/// What a failed commit leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Return to the exact pre-commit state so the commit can be retried.
    ///
    /// Only writes undone by the commit's own transaction are rewound; writes
    /// storage kept are reconciled and only the unmet intents stay queued.
    #[default]
    Restore,
    /// Drop every queued intent. Field values written during the failed
    /// commit stay on the entities.
    Discard,
}

/// Configuration for unit of work behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Wrap a non-empty commit in a transaction when none is open.
    pub implicit_transactions: bool,
    /// Reject kind mismatches instead of coercing convertible values.
    pub strict_validation: bool,
    /// What a failed commit leaves behind.
    pub failure_policy: FailurePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            implicit_transactions: true,
            strict_validation: false,
            failure_policy: FailurePolicy::Restore,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_implicit_transactions(mut self, value: bool) -> Self {
        self.implicit_transactions = value;
        self
    }

    #[must_use]
    pub fn with_strict_validation(mut self, value: bool) -> Self {
        self.strict_validation = value;
        self
    }

    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// Sizes of the intent queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Entities queued for insert or update
    pub persist: usize,
    /// Entities queued for delete
    pub remove: usize,
    /// Entities detached from orphan-removing relations
    pub orphan: usize,
}

impl PendingCounts {
    /// Total number of queued intents.
    #[must_use]
    pub fn total(&self) -> usize {
        self.persist + self.remove + self.orphan
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}
