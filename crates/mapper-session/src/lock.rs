//! Row-level locking for managed entities.
//!
//! - Optimistic: compare a caller-supplied version with the entity's version,
//!   loading the entity first if it is only a reference.
//! - Pessimistic: ask the storage port for a shared or exclusive row lock
//!   inside the already open transaction.

use crate::unit_of_work::UnitOfWork;
use asupersync::{Cx, Outcome};
use mapper_core::{
    EntityHandle, Error, FieldKind, LockError, LockMode, Result, RowIdentity, StorageOps,
    ValidationError, Value,
};

impl UnitOfWork {
    /// Lock `entity` in `mode`.
    ///
    /// Optimistic locking without `expected_version` only checks that the
    /// entity type is versioned.
    #[tracing::instrument(level = "debug", skip(self, cx, ops, expected_version))]
    pub async fn lock<O: StorageOps>(
        &mut self,
        cx: &Cx,
        ops: &O,
        entity: EntityHandle,
        mode: LockMode,
        expected_version: Option<Value>,
    ) -> Outcome<(), Error> {
        let identity = match self.managed_identity(entity) {
            Ok(identity) => identity,
            Err(e) => return Outcome::Err(e),
        };

        if mode.is_pessimistic() {
            if !ops.is_in_transaction() {
                return Outcome::Err(ValidationError::transaction_required().into());
            }
            let name = match self.entity(entity) {
                Ok(e) => e.name(),
                Err(e) => return Outcome::Err(e),
            };
            tracing::debug!(entity = %entity, ?mode, "Acquiring row lock");
            return ops.lock_row(cx, name, &identity, mode).await;
        }

        let versioned = match self.entity(entity) {
            Ok(e) => e.meta().version_field().is_some(),
            Err(e) => return Outcome::Err(e),
        };
        if !versioned {
            let label = match self.entity(entity) {
                Ok(e) => e.label(entity),
                Err(e) => return Outcome::Err(e),
            };
            return Outcome::Err(LockError::not_versioned(label).into());
        }
        let Some(expected) = expected_version else {
            return Outcome::Ok(());
        };

        match self.initialize(cx, ops, entity).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        match self.check_version(entity, expected) {
            Ok(()) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Row identity of `entity`, which must be identity-mapped here.
    fn managed_identity(&self, entity: EntityHandle) -> Result<RowIdentity> {
        let e = self.entity(entity)?;
        let meta = e.meta();
        let pk = e
            .primary_key()
            .filter(|pk| self.get_by_id(meta, pk) == Some(entity))
            .ok_or_else(|| Error::from(ValidationError::entity_not_managed(e.label(entity))))?;
        Ok(RowIdentity::new(
            meta.primary_key_names().into_iter().zip(pk).collect(),
        ))
    }

    fn check_version(&self, entity: EntityHandle, expected: Value) -> Result<()> {
        let e = self.entity(entity)?;
        let kind = e.meta().version_field().map_or(FieldKind::Integer, |f| f.kind);
        let actual = e.version().cloned().unwrap_or(Value::Null);
        if versions_match(kind, &expected, &actual) {
            tracing::trace!(entity = %entity, version = %actual, "Version check passed");
            return Ok(());
        }
        tracing::debug!(entity = %entity, expected = %expected, actual = %actual, "Version mismatch");
        Err(LockError::version_mismatch(e.label(entity), expected, actual).into())
    }
}

/// Numeric equality for counters, millisecond equality for timestamps.
fn versions_match(kind: FieldKind, expected: &Value, actual: &Value) -> bool {
    match kind {
        FieldKind::Date | FieldKind::Timestamp => match (expected.as_millis(), actual.as_millis()) {
            (Some(a), Some(b)) => a == b,
            _ => expected.semantic_eq(actual),
        },
        _ => match (expected.as_i64(), actual.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => expected.semantic_eq(actual),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        runtime, unwrap_err, unwrap_outcome, Call, RecordingStorage, RecordingTx, ARTICLE, AUTHOR,
    };
    use mapper_core::{LockErrorKind, Payload, ValidationErrorKind};

    fn loaded_article(uow: &mut UnitOfWork, version: i64) -> EntityHandle {
        let mut row = Payload::new();
        row.insert("id", Value::BigInt(1));
        row.insert("title", Value::Text("Hello".into()));
        row.insert("status", Value::Text("draft".into()));
        row.insert("version", Value::BigInt(version));
        uow.merge_row(&ARTICLE, row).unwrap()
    }

    #[test]
    fn optimistic_lock_with_matching_version_passes() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let storage = RecordingStorage::new();
        let mut uow = UnitOfWork::new();
        let article = loaded_article(&mut uow, 3);

        rt.block_on(async {
            unwrap_outcome(
                uow.lock(&cx, &storage, article, LockMode::Optimistic, Some(Value::Int(3)))
                    .await,
            );
        });
        assert!(storage.calls().is_empty());
    }

    #[test]
    fn optimistic_lock_with_stale_version_fails() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let storage = RecordingStorage::new();
        let mut uow = UnitOfWork::new();
        let article = loaded_article(&mut uow, 3);

        let err = rt.block_on(async {
            unwrap_err(
                uow.lock(&cx, &storage, article, LockMode::Optimistic, Some(Value::BigInt(2)))
                    .await,
            )
        });
        assert_eq!(err.lock_kind(), Some(LockErrorKind::VersionMismatch));
        assert_eq!(err.entity().and_then(|l| l.handle), Some(article));
    }

    #[test]
    fn optimistic_lock_requires_version_field() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let storage = RecordingStorage::new();
        let mut uow = UnitOfWork::new();
        let author = uow.reference(&AUTHOR, &[Value::BigInt(1)]);

        let err = rt.block_on(async {
            unwrap_err(
                uow.lock(&cx, &storage, author, LockMode::Optimistic, None)
                    .await,
            )
        });
        assert_eq!(err.lock_kind(), Some(LockErrorKind::NotVersioned));
    }

    #[test]
    fn optimistic_lock_loads_references_first() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let storage = RecordingStorage::new();
        let mut row = Payload::new();
        row.insert("id", Value::BigInt(1));
        row.insert("title", Value::Text("Hello".into()));
        row.insert("version", Value::BigInt(7));
        storage.add_row("Article", &[Value::BigInt(1)], row);

        let mut uow = UnitOfWork::new();
        let article = uow.reference(&ARTICLE, &[Value::BigInt(1)]);
        rt.block_on(async {
            unwrap_outcome(
                uow.lock(&cx, &storage, article, LockMode::Optimistic, Some(Value::BigInt(7)))
                    .await,
            );
        });

        assert_eq!(storage.trace(), vec!["FETCH Article"]);
        let entity = uow.entity(article).unwrap();
        assert!(entity.is_initialized());
        assert_eq!(entity.version(), Some(&Value::BigInt(7)));
        assert!(uow.original_data(article).is_some());
    }

    #[test]
    fn timestamp_versions_compare_at_millisecond_precision() {
        assert!(versions_match(
            FieldKind::Timestamp,
            &Value::Timestamp(1_000_123),
            &Value::Timestamp(1_000_999)
        ));
        assert!(!versions_match(
            FieldKind::Timestamp,
            &Value::Timestamp(1_000_000),
            &Value::Timestamp(1_001_000)
        ));
        assert!(versions_match(FieldKind::Integer, &Value::Int(4), &Value::BigInt(4)));
    }

    #[test]
    fn pessimistic_lock_requires_transaction() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let storage = RecordingStorage::new();
        let mut uow = UnitOfWork::new();
        let article = loaded_article(&mut uow, 1);

        let err = rt.block_on(async {
            unwrap_err(
                uow.lock(&cx, &storage, article, LockMode::PessimisticWrite, None)
                    .await,
            )
        });
        assert_eq!(
            err.validation_kind(),
            Some(ValidationErrorKind::TransactionRequired)
        );
        assert!(storage.calls().is_empty());
    }

    #[test]
    fn pessimistic_lock_goes_through_the_transaction() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let storage = RecordingStorage::new();
        let tx = RecordingTx::new(&storage);
        let mut uow = UnitOfWork::new();
        let article = loaded_article(&mut uow, 1);

        rt.block_on(async {
            unwrap_outcome(
                uow.lock(&cx, &tx, article, LockMode::PessimisticRead, None)
                    .await,
            );
        });
        assert_eq!(
            storage.calls(),
            vec![Call::Lock {
                entity: "Article",
                mode: LockMode::PessimisticRead
            }]
        );
    }

    #[test]
    fn unmanaged_entities_cannot_be_locked() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let storage = RecordingStorage::new();
        let mut uow = UnitOfWork::new();
        let fresh = uow.create(&ARTICLE);
        let foreign = UnitOfWork::new().create(&ARTICLE);

        for entity in [fresh, foreign] {
            let err = rt.block_on(async {
                unwrap_err(
                    uow.lock(&cx, &storage, entity, LockMode::Optimistic, None)
                        .await,
                )
            });
            assert_eq!(
                err.validation_kind(),
                Some(ValidationErrorKind::EntityNotManaged)
            );
        }
    }
}
