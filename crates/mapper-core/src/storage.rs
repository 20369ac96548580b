//! Storage port traits.
//!
//! The unit of work never builds queries itself. Every write, row lock and
//! reference load goes through these traits:
//!
//! - [`StorageOps`] - row-level operations shared by ports and transactions
//! - [`StoragePort`] - a backend that may open transactions
//! - [`StorageTransaction`] - an open transaction, consumed by commit/rollback
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for proper cancellation and timeout handling.

use crate::value::Value;
use asupersync::{Cx, Outcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A resolved field -> value map, as sent to storage.
pub type Payload = BTreeMap<&'static str, Value>;

/// Row-level lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Version check against a caller-supplied version
    Optimistic,
    /// Shared row lock (`FOR SHARE`)
    PessimisticRead,
    /// Exclusive row lock (`FOR UPDATE`)
    PessimisticWrite,
}

impl LockMode {
    pub const fn is_pessimistic(&self) -> bool {
        matches!(self, LockMode::PessimisticRead | LockMode::PessimisticWrite)
    }
}

/// Identifies the row a write or lock targets.
#[derive(Debug, Clone, PartialEq)]
pub struct RowIdentity {
    /// Primary key columns and values
    pub primary_key: Vec<(&'static str, Value)>,
    /// Expected version; a write must match no row if it differs
    pub version: Option<(&'static str, Value)>,
}

impl RowIdentity {
    pub fn new(primary_key: Vec<(&'static str, Value)>) -> Self {
        Self {
            primary_key,
            version: None,
        }
    }

    pub fn with_version(mut self, field: &'static str, version: Value) -> Self {
        self.version = Some((field, version));
        self
    }

    /// Primary key values in column order.
    pub fn key_values(&self) -> Vec<Value> {
        self.primary_key.iter().map(|(_, v)| v.clone()).collect()
    }
}

/// Row-level operations available on a storage port or inside one of its
/// transactions.
pub trait StorageOps: Send + Sync {
    /// Whether writes issued through this handle run inside a transaction.
    fn is_in_transaction(&self) -> bool;

    /// Insert a row and return the generated primary key.
    ///
    /// Returns `Value::Null` when the key was supplied in the payload.
    fn insert(
        &self,
        cx: &Cx,
        entity: &'static str,
        payload: &Payload,
    ) -> impl Future<Output = Outcome<Value, crate::Error>> + Send;

    /// Update the row matching `identity` and return the affected row count.
    fn update(
        &self,
        cx: &Cx,
        entity: &'static str,
        identity: &RowIdentity,
        payload: &Payload,
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Delete the row matching `identity` and return the affected row count.
    fn delete(
        &self,
        cx: &Cx,
        entity: &'static str,
        identity: &RowIdentity,
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Load the current field values of one row.
    fn fetch(
        &self,
        cx: &Cx,
        entity: &'static str,
        identity: &RowIdentity,
    ) -> impl Future<Output = Outcome<Option<Payload>, crate::Error>> + Send;

    /// Acquire a pessimistic row lock for the rest of the current transaction.
    fn lock_row(
        &self,
        cx: &Cx,
        entity: &'static str,
        identity: &RowIdentity,
        mode: LockMode,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;
}

/// A storage backend.
pub trait StoragePort: StorageOps {
    /// The transaction type returned by this port.
    type Tx<'port>: StorageTransaction
    where
        Self: 'port;

    /// Whether [`begin`](Self::begin) is available.
    fn supports_transactions(&self) -> bool;

    /// Begin a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, crate::Error>> + Send;
}

/// An open transaction.
///
/// `commit` and `rollback` consume the transaction, so a handle cannot be
/// reused once it has finished.
pub trait StorageTransaction: StorageOps {
    /// Commit the transaction.
    fn commit(self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Rollback the transaction, discarding all changes.
    fn rollback(self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;
}
