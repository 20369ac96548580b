//! Shared fixtures for the end-to-end tests: entity metadata and an
//! in-memory storage port with real transaction semantics.

#![allow(dead_code)]

use asupersync::runtime::{Runtime, RuntimeBuilder};
use mapper::prelude::*;
use mapper::{StorageError, StorageErrorKind};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

// ============================================================================
// Entities
// ============================================================================

const AUTHOR_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", FieldKind::Integer).primary_key(true),
    FieldInfo::new("name", FieldKind::Text),
    FieldInfo::new("email", FieldKind::Text).nullable(true),
];
const AUTHOR_RELATIONS: &[RelationInfo] = &[
    RelationInfo::new("books", "Book", RelationKind::OneToMany)
        .cascade(&[Cascade::Persist, Cascade::Remove]),
    RelationInfo::new("partner", "Author", RelationKind::ManyToOne)
        .cascade(&[Cascade::Persist]),
];
pub static AUTHOR: EntityMeta = EntityMeta::new("Author", AUTHOR_FIELDS, AUTHOR_RELATIONS);

const BOOK_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", FieldKind::Integer).primary_key(true),
    FieldInfo::new("title", FieldKind::Text),
];
const BOOK_RELATIONS: &[RelationInfo] = &[
    RelationInfo::new("author", "Author", RelationKind::ManyToOne)
        .cascade(&[Cascade::Persist]),
    RelationInfo::new("tags", "Tag", RelationKind::ManyToMany)
        .owner(true)
        .cascade(&[Cascade::Persist]),
];
pub static BOOK: EntityMeta = EntityMeta::new("Book", BOOK_FIELDS, BOOK_RELATIONS);

const TAG_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", FieldKind::Integer).primary_key(true),
    FieldInfo::new("label", FieldKind::Text),
];
pub static TAG: EntityMeta = EntityMeta::new("Tag", TAG_FIELDS, &[]);

const ACCOUNT_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", FieldKind::Integer).primary_key(true),
    FieldInfo::new("balance", FieldKind::Integer),
    FieldInfo::new("version", FieldKind::Integer).version(true),
];
pub static ACCOUNT: EntityMeta = EntityMeta::new("Account", ACCOUNT_FIELDS, &[]);

// ============================================================================
// In-memory storage
// ============================================================================

type Table = BTreeMap<String, Payload>;

#[derive(Debug, Clone, Default)]
struct Tables {
    tables: BTreeMap<&'static str, Table>,
    next_id: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    data: Tables,
    /// Copy of `data` taken when the open transaction began
    backup: Option<Tables>,
    fail_on: Option<(&'static str, &'static str)>,
    locks: Vec<(&'static str, String, LockMode)>,
    log: Vec<String>,
    begun: usize,
    committed: usize,
    rolled_back: usize,
}

impl MemoryState {
    fn check(&mut self, op: &'static str, entity: &'static str) -> Result<()> {
        if self.fail_on == Some((op, entity)) {
            self.fail_on = None;
            return Err(StorageError::new(
                StorageErrorKind::Constraint,
                format!("{op} on {entity} violates a constraint"),
            )
            .into());
        }
        Ok(())
    }

    fn insert(&mut self, entity: &'static str, payload: &Payload) -> Result<Value> {
        self.log.push(format!("INSERT {entity}"));
        self.check("INSERT", entity)?;
        let mut row = payload.clone();
        let generated = match row.get("id") {
            Some(id) if !id.is_null() => Value::Null,
            _ => {
                self.data.next_id += 1;
                let id = Value::BigInt(self.data.next_id);
                row.insert("id", id.clone());
                id
            }
        };
        let key = row.get("id").map(Value::key_fragment).unwrap_or_default();
        let table = self.data.tables.entry(entity).or_default();
        if table.contains_key(&key) {
            return Err(StorageError::new(
                StorageErrorKind::Constraint,
                format!("duplicate key {key} in {entity}"),
            )
            .into());
        }
        table.insert(key, row);
        Ok(generated)
    }

    /// The row `identity` targets, if it exists and its version matches.
    fn target(&mut self, entity: &'static str, identity: &RowIdentity) -> Option<&mut Payload> {
        let row = self
            .data
            .tables
            .get_mut(entity)?
            .get_mut(&row_key(identity))?;
        match &identity.version {
            Some((field, expected)) => row
                .get(field)
                .is_some_and(|actual| actual.semantic_eq(expected))
                .then_some(row),
            None => Some(row),
        }
    }

    fn update(&mut self, entity: &'static str, identity: &RowIdentity, payload: &Payload) -> Result<u64> {
        self.log.push(format!("UPDATE {entity}"));
        self.check("UPDATE", entity)?;
        let Some(row) = self.target(entity, identity) else {
            return Ok(0);
        };
        row.extend(payload.iter().map(|(k, v)| (*k, v.clone())));
        Ok(1)
    }

    fn delete(&mut self, entity: &'static str, identity: &RowIdentity) -> Result<u64> {
        self.log.push(format!("DELETE {entity}"));
        self.check("DELETE", entity)?;
        if self.target(entity, identity).is_none() {
            return Ok(0);
        }
        let removed = self
            .data
            .tables
            .get_mut(entity)
            .and_then(|t| t.remove(&row_key(identity)));
        Ok(u64::from(removed.is_some()))
    }

    fn fetch(&mut self, entity: &'static str, identity: &RowIdentity) -> Option<Payload> {
        self.log.push(format!("FETCH {entity}"));
        self.data.tables.get(entity)?.get(&row_key(identity)).cloned()
    }
}

fn row_key(identity: &RowIdentity) -> String {
    identity
        .key_values()
        .iter()
        .map(Value::key_fragment)
        .collect::<Vec<_>>()
        .join("~~~")
}

fn into_outcome<T>(result: Result<T>) -> Outcome<T, Error> {
    result.map_or_else(Outcome::Err, Outcome::Ok)
}

/// In-memory storage keyed by each row's `id` column.
///
/// Transactions copy the tables on `begin` and put the copy back on
/// `rollback`. Clones share the same tables, so a clone can play the part of
/// a second client writing out of band.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `op` ("INSERT", "UPDATE", "DELETE") on `entity`.
    pub fn fail_next(&self, op: &'static str, entity: &'static str) {
        self.state.lock().unwrap().fail_on = Some((op, entity));
    }

    /// Current contents of one row.
    pub fn row(&self, entity: &'static str, id: i64) -> Option<Payload> {
        let key = Value::BigInt(id).key_fragment();
        let state = self.state.lock().unwrap();
        state.data.tables.get(entity)?.get(&key).cloned()
    }

    pub fn count(&self, entity: &'static str) -> usize {
        let state = self.state.lock().unwrap();
        state.data.tables.get(entity).map_or(0, BTreeMap::len)
    }

    /// Overwrite columns of a row behind every unit of work's back.
    pub fn write_out_of_band(&self, entity: &'static str, id: i64, values: &[(&'static str, Value)]) {
        let key = Value::BigInt(id).key_fragment();
        let mut state = self.state.lock().unwrap();
        let row = state
            .data
            .tables
            .get_mut(entity)
            .and_then(|t| t.get_mut(&key))
            .expect("row exists");
        for (field, value) in values {
            row.insert(*field, value.clone());
        }
    }

    /// Every statement issued so far, as `OP entity`.
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    /// `(begun, committed, rolled back)` transaction counts.
    pub fn transactions(&self) -> (usize, usize, usize) {
        let state = self.state.lock().unwrap();
        (state.begun, state.committed, state.rolled_back)
    }

    pub fn locks(&self) -> Vec<(&'static str, String, LockMode)> {
        self.state.lock().unwrap().locks.clone()
    }
}

macro_rules! storage_ops {
    ($ty:ty, $in_tx:expr) => {
        impl StorageOps for $ty {
            fn is_in_transaction(&self) -> bool {
                $in_tx
            }

            fn insert(
                &self,
                _cx: &Cx,
                entity: &'static str,
                payload: &Payload,
            ) -> impl Future<Output = Outcome<Value, Error>> + Send {
                let result = self.state.lock().unwrap().insert(entity, payload);
                async move { into_outcome(result) }
            }

            fn update(
                &self,
                _cx: &Cx,
                entity: &'static str,
                identity: &RowIdentity,
                payload: &Payload,
            ) -> impl Future<Output = Outcome<u64, Error>> + Send {
                let result = self.state.lock().unwrap().update(entity, identity, payload);
                async move { into_outcome(result) }
            }

            fn delete(
                &self,
                _cx: &Cx,
                entity: &'static str,
                identity: &RowIdentity,
            ) -> impl Future<Output = Outcome<u64, Error>> + Send {
                let result = self.state.lock().unwrap().delete(entity, identity);
                async move { into_outcome(result) }
            }

            fn fetch(
                &self,
                _cx: &Cx,
                entity: &'static str,
                identity: &RowIdentity,
            ) -> impl Future<Output = Outcome<Option<Payload>, Error>> + Send {
                let row = self.state.lock().unwrap().fetch(entity, identity);
                async move { Outcome::Ok(row) }
            }

            fn lock_row(
                &self,
                _cx: &Cx,
                entity: &'static str,
                identity: &RowIdentity,
                mode: LockMode,
            ) -> impl Future<Output = Outcome<(), Error>> + Send {
                self.state
                    .lock()
                    .unwrap()
                    .locks
                    .push((entity, row_key(identity), mode));
                async { Outcome::Ok(()) }
            }
        }
    };
}

storage_ops!(MemoryStorage, false);
storage_ops!(MemoryTx, true);

impl StoragePort for MemoryStorage {
    type Tx<'port>
        = MemoryTx
    where
        Self: 'port;

    fn supports_transactions(&self) -> bool {
        true
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        let mut state = self.state.lock().unwrap();
        state.backup = Some(state.data.clone());
        state.begun += 1;
        state.log.push("BEGIN".into());
        let tx = MemoryTx {
            state: Arc::clone(&self.state),
        };
        async move { Outcome::Ok(tx) }
    }
}

/// Transaction over a [`MemoryStorage`].
#[derive(Debug)]
pub struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTx {
    /// Open a transaction directly, for callers that manage it themselves.
    pub fn begin(storage: &MemoryStorage) -> Self {
        let mut state = storage.state.lock().unwrap();
        state.backup = Some(state.data.clone());
        state.begun += 1;
        state.log.push("BEGIN".into());
        Self {
            state: Arc::clone(&storage.state),
        }
    }
}

impl StorageTransaction for MemoryTx {
    fn commit(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let mut state = self.state.lock().unwrap();
        state.backup = None;
        state.committed += 1;
        state.log.push("COMMIT".into());
        async { Outcome::Ok(()) }
    }

    fn rollback(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let mut state = self.state.lock().unwrap();
        if let Some(backup) = state.backup.take() {
            state.data = backup;
        }
        state.rolled_back += 1;
        state.log.push("ROLLBACK".into());
        async { Outcome::Ok(()) }
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn runtime() -> Runtime {
    RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime")
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn unwrap_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

/// A loaded row as a storage read would return it.
pub fn row(entries: &[(&'static str, Value)]) -> Payload {
    entries.iter().cloned().collect()
}
