//! Entity fixtures and a recording storage port shared by unit tests.

use asupersync::runtime::{Runtime, RuntimeBuilder};
use asupersync::{Cx, Outcome};
use mapper_core::{
    Cascade, EntityMeta, Error, FieldInfo, FieldKind, LockMode, Payload, RelationInfo,
    RelationKind, RowIdentity, StorageError, StorageErrorKind, StorageOps, StoragePort,
    StorageTransaction, Value,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const AUTHOR_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", FieldKind::Integer).primary_key(true),
    FieldInfo::new("name", FieldKind::Text),
    FieldInfo::new("age", FieldKind::Integer).nullable(true),
];
const AUTHOR_RELATIONS: &[RelationInfo] = &[
    RelationInfo::new("books", "Book", RelationKind::OneToMany)
        .cascade(&[Cascade::Persist, Cascade::Remove]),
    RelationInfo::new("favorite", "Book", RelationKind::ManyToOne),
];
pub(crate) static AUTHOR: EntityMeta = EntityMeta::new("Author", AUTHOR_FIELDS, AUTHOR_RELATIONS);
pub(crate) static SPECIAL_AUTHOR: EntityMeta =
    EntityMeta::new("SpecialAuthor", AUTHOR_FIELDS, AUTHOR_RELATIONS).root("Author");

const BOOK_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", FieldKind::Integer).primary_key(true),
    FieldInfo::new("title", FieldKind::Text),
];
const BOOK_RELATIONS: &[RelationInfo] = &[
    RelationInfo::new("author", "Author", RelationKind::ManyToOne)
        .cascade(&[Cascade::Persist, Cascade::Merge]),
    RelationInfo::new("tags", "Tag", RelationKind::ManyToMany)
        .owner(true)
        .cascade(&[Cascade::Persist]),
    RelationInfo::new("cover", "Cover", RelationKind::OneToOne)
        .owner(true)
        .orphan_removal(true)
        .cascade(&[Cascade::Persist]),
];
pub(crate) static BOOK: EntityMeta = EntityMeta::new("Book", BOOK_FIELDS, BOOK_RELATIONS);

const TAG_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", FieldKind::Integer).primary_key(true),
    FieldInfo::new("label", FieldKind::Text),
];
pub(crate) static TAG: EntityMeta = EntityMeta::new("Tag", TAG_FIELDS, &[]);

const COVER_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", FieldKind::Integer).primary_key(true),
    FieldInfo::new("url", FieldKind::Text).nullable(true),
];
pub(crate) static COVER: EntityMeta = EntityMeta::new("Cover", COVER_FIELDS, &[]);

const TAGGED_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("book_id", FieldKind::Integer).primary_key(true),
    FieldInfo::new("tag_id", FieldKind::Integer).primary_key(true),
    FieldInfo::new("note", FieldKind::Text).nullable(true),
];
pub(crate) static TAGGED: EntityMeta = EntityMeta::new("Tagged", TAGGED_FIELDS, &[]);

fn draft() -> Value {
    Value::Text("draft".into())
}

const ARTICLE_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", FieldKind::Integer).primary_key(true),
    FieldInfo::new("title", FieldKind::Text),
    FieldInfo::new("status", FieldKind::Text).on_create(draft),
    FieldInfo::new("version", FieldKind::Integer).version(true),
    FieldInfo::new("updated_at", FieldKind::Timestamp)
        .nullable(true)
        .on_update(Value::now),
];
pub(crate) static ARTICLE: EntityMeta = EntityMeta::new("Article", ARTICLE_FIELDS, &[]);

const NODE_FIELDS: &[FieldInfo] = &[
    FieldInfo::new("id", FieldKind::Integer).primary_key(true),
    FieldInfo::new("name", FieldKind::Text),
];
const NODE_RELATIONS: &[RelationInfo] = &[
    RelationInfo::new("next", "Node", RelationKind::ManyToOne).cascade(&[Cascade::Persist]),
    RelationInfo::new("links", "Node", RelationKind::ManyToMany).owner(true),
];
pub(crate) static NODE: EntityMeta = EntityMeta::new("Node", NODE_FIELDS, NODE_RELATIONS);

pub(crate) static LEDGER: EntityMeta =
    EntityMeta::new("Ledger", NODE_FIELDS, &[]).readonly(true);

/// A storage call, as seen by [`RecordingStorage`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Begin,
    Commit,
    Rollback,
    Insert {
        entity: &'static str,
        payload: Payload,
        in_tx: bool,
    },
    Update {
        entity: &'static str,
        identity: RowIdentity,
        payload: Payload,
        in_tx: bool,
    },
    Delete {
        entity: &'static str,
        identity: RowIdentity,
        in_tx: bool,
    },
    Fetch {
        entity: &'static str,
    },
    Lock {
        entity: &'static str,
        mode: LockMode,
    },
}

impl Call {
    /// Short `OP entity` form for order assertions.
    pub(crate) fn describe(&self) -> String {
        match self {
            Call::Begin => "BEGIN".into(),
            Call::Commit => "COMMIT".into(),
            Call::Rollback => "ROLLBACK".into(),
            Call::Insert { entity, .. } => format!("INSERT {entity}"),
            Call::Update { entity, .. } => format!("UPDATE {entity}"),
            Call::Delete { entity, .. } => format!("DELETE {entity}"),
            Call::Fetch { entity } => format!("FETCH {entity}"),
            Call::Lock { entity, .. } => format!("LOCK {entity}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Insert,
    Update,
    Delete,
}

#[derive(Debug)]
pub(crate) struct RecordingState {
    pub calls: Vec<Call>,
    pub next_id: i64,
    /// Fail the first matching write
    pub fail_on: Option<(Op, &'static str)>,
    /// Affected-row count returned by updates and deletes
    pub affected: u64,
    /// Rows returned by `fetch`, keyed by entity and serialized key
    pub rows: HashMap<(&'static str, String), Payload>,
    /// Whether the port itself reports an open transaction
    pub in_transaction: bool,
    pub supports_transactions: bool,
}

impl Default for RecordingState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            next_id: 1,
            fail_on: None,
            affected: 1,
            rows: HashMap::new(),
            in_transaction: false,
            supports_transactions: true,
        }
    }
}

impl RecordingState {
    fn check(&mut self, op: Op, entity: &'static str) -> Result<(), Error> {
        if self.fail_on == Some((op, entity)) {
            self.fail_on = None;
            return Err(StorageError::new(
                StorageErrorKind::Constraint,
                format!("{op:?} on {entity} rejected"),
            )
            .into());
        }
        Ok(())
    }

    fn insert(&mut self, entity: &'static str, payload: &Payload, in_tx: bool) -> Result<Value, Error> {
        self.calls.push(Call::Insert {
            entity,
            payload: payload.clone(),
            in_tx,
        });
        self.check(Op::Insert, entity)?;
        if payload.get("id").is_some_and(|v| !v.is_null()) {
            return Ok(Value::Null);
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(Value::BigInt(id))
    }

    fn update(
        &mut self,
        entity: &'static str,
        identity: &RowIdentity,
        payload: &Payload,
        in_tx: bool,
    ) -> Result<u64, Error> {
        self.calls.push(Call::Update {
            entity,
            identity: identity.clone(),
            payload: payload.clone(),
            in_tx,
        });
        self.check(Op::Update, entity)?;
        Ok(self.affected)
    }

    fn delete(&mut self, entity: &'static str, identity: &RowIdentity, in_tx: bool) -> Result<u64, Error> {
        self.calls.push(Call::Delete {
            entity,
            identity: identity.clone(),
            in_tx,
        });
        self.check(Op::Delete, entity)?;
        Ok(self.affected)
    }

    fn fetch(&mut self, entity: &'static str, identity: &RowIdentity) -> Option<Payload> {
        self.calls.push(Call::Fetch { entity });
        self.rows.get(&(entity, row_key(identity))).cloned()
    }
}

fn row_key(identity: &RowIdentity) -> String {
    identity
        .key_values()
        .iter()
        .map(Value::key_fragment)
        .collect::<Vec<_>>()
        .join("/")
}

fn into_outcome<T>(result: Result<T, Error>) -> Outcome<T, Error> {
    result.map_or_else(Outcome::Err, Outcome::Ok)
}

/// Storage port that records every call and generates sequential keys.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingStorage {
    pub state: Arc<Mutex<RecordingState>>,
}

impl RecordingStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn without_transactions() -> Self {
        let storage = Self::new();
        storage.state.lock().unwrap().supports_transactions = false;
        storage
    }

    pub(crate) fn fail_on(&self, op: Op, entity: &'static str) {
        self.state.lock().unwrap().fail_on = Some((op, entity));
    }

    pub(crate) fn set_affected(&self, affected: u64) {
        self.state.lock().unwrap().affected = affected;
    }

    pub(crate) fn set_in_transaction(&self, in_transaction: bool) {
        self.state.lock().unwrap().in_transaction = in_transaction;
    }

    pub(crate) fn add_row(&self, entity: &'static str, key: &[Value], row: Payload) {
        let key = key.iter().map(Value::key_fragment).collect::<Vec<_>>().join("/");
        self.state.lock().unwrap().rows.insert((entity, key), row);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// `OP entity` for every call, in order.
    pub(crate) fn trace(&self) -> Vec<String> {
        self.calls().iter().map(Call::describe).collect()
    }

    pub(crate) fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }
}

impl StorageOps for RecordingStorage {
    fn is_in_transaction(&self) -> bool {
        self.state.lock().unwrap().in_transaction
    }

    fn insert(
        &self,
        _cx: &Cx,
        entity: &'static str,
        payload: &Payload,
    ) -> impl Future<Output = Outcome<Value, Error>> + Send {
        let mut guard = self.state.lock().unwrap();
        let in_tx = guard.in_transaction;
        let result = guard.insert(entity, payload, in_tx);
        async move { into_outcome(result) }
    }

    fn update(
        &self,
        _cx: &Cx,
        entity: &'static str,
        identity: &RowIdentity,
        payload: &Payload,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let mut guard = self.state.lock().unwrap();
        let in_tx = guard.in_transaction;
        let result = guard.update(entity, identity, payload, in_tx);
        async move { into_outcome(result) }
    }

    fn delete(
        &self,
        _cx: &Cx,
        entity: &'static str,
        identity: &RowIdentity,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let mut guard = self.state.lock().unwrap();
        let in_tx = guard.in_transaction;
        let result = guard.delete(entity, identity, in_tx);
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
        _identity: &RowIdentity,
        mode: LockMode,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.state.lock().unwrap().calls.push(Call::Lock { entity, mode });
        async { Outcome::Ok(()) }
    }
}

impl StoragePort for RecordingStorage {
    type Tx<'port>
        = RecordingTx
    where
        Self: 'port;

    fn supports_transactions(&self) -> bool {
        self.state.lock().unwrap().supports_transactions
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        self.state.lock().unwrap().calls.push(Call::Begin);
        let tx = RecordingTx {
            state: Arc::clone(&self.state),
        };
        async move { Outcome::Ok(tx) }
    }
}

/// Transaction handed out by [`RecordingStorage::begin`].
#[derive(Debug)]
pub(crate) struct RecordingTx {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingTx {
    pub(crate) fn new(storage: &RecordingStorage) -> Self {
        Self {
            state: Arc::clone(&storage.state),
        }
    }
}

impl StorageOps for RecordingTx {
    fn is_in_transaction(&self) -> bool {
        true
    }

    fn insert(
        &self,
        _cx: &Cx,
        entity: &'static str,
        payload: &Payload,
    ) -> impl Future<Output = Outcome<Value, Error>> + Send {
        let result = self.state.lock().unwrap().insert(entity, payload, true);
        async move { into_outcome(result) }
    }

    fn update(
        &self,
        _cx: &Cx,
        entity: &'static str,
        identity: &RowIdentity,
        payload: &Payload,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self
            .state
            .lock()
            .unwrap()
            .update(entity, identity, payload, true);
        async move { into_outcome(result) }
    }

    fn delete(
        &self,
        _cx: &Cx,
        entity: &'static str,
        identity: &RowIdentity,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.state.lock().unwrap().delete(entity, identity, true);
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
        _identity: &RowIdentity,
        mode: LockMode,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.state.lock().unwrap().calls.push(Call::Lock { entity, mode });
        async { Outcome::Ok(()) }
    }
}

impl StorageTransaction for RecordingTx {
    fn commit(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.state.lock().unwrap().calls.push(Call::Commit);
        async { Outcome::Ok(()) }
    }

    fn rollback(self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.state.lock().unwrap().calls.push(Call::Rollback);
        async { Outcome::Ok(()) }
    }
}

pub(crate) fn runtime() -> Runtime {
    RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime")
}

pub(crate) fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub(crate) fn unwrap_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}
