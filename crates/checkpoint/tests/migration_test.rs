//! End-to-end tests for migrating a legacy checkpoint file into the shared store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use cloudtap_checkpoint::{
    BatchSaveReport, CheckpointMigrator, CheckpointStore, FileCheckpointStore, MarkerStore,
    MemoryKvBackend, MemoryMarkerStore, MigrationError, MigrationKind, MigrationOutcome,
    MigrationPhase, RemoteCheckpointStore, RetryPolicy, StoreError,
};
use cloudtap_core::{CheckpointKey, CheckpointRecord, MigrationState};

const COLLECTION: &str = "ckpt";

async fn seed_legacy(dir: &Path, entries: &[(&str, serde_json::Value)]) -> PathBuf {
    let path = dir.join("billing_input.ckpt");
    let store = FileCheckpointStore::open(&path, "/MK/").unwrap();
    for (key, value) in entries {
        store
            .update(CheckpointRecord::new(*key, value.clone()))
            .await
            .unwrap();
    }
    store.close().await.unwrap();
    path
}

async fn remote(limit: usize) -> (Arc<MemoryKvBackend>, Arc<RemoteCheckpointStore>) {
    let backend = Arc::new(MemoryKvBackend::new(limit));
    let store = RemoteCheckpointStore::connect(backend.clone(), COLLECTION, RetryPolicy::none())
        .await
        .unwrap();
    (backend, Arc::new(store))
}

#[tokio::test]
async fn two_records_with_limit_one_then_noop() {
    let tmp = tempfile::tempdir().unwrap();
    let path = seed_legacy(tmp.path(), &[("obj1", json!(100)), ("obj2", json!(250))]).await;
    let (backend, store) = remote(1).await;
    let markers = Arc::new(MemoryMarkerStore::new());

    let migrator = CheckpointMigrator::new("billing_input", &path, store.clone(), markers.clone());
    let outcome = migrator.migrate().await.unwrap();

    assert_eq!(outcome, MigrationOutcome::Completed { migrated: 2 });
    assert_eq!(migrator.phase(), MigrationPhase::Completed);
    assert_eq!(backend.batch_calls(), vec![1, 1]);
    assert!(!path.exists());
    assert!(!FileCheckpointStore::lock_path_for(&path).exists());
    assert!(markers.load("billing_input").await.unwrap().is_migrated());

    let records = backend.records(COLLECTION);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0], CheckpointRecord::new("obj1", json!(100)));
    assert_eq!(records[1], CheckpointRecord::new("obj2", json!(250)));

    let calls_before = backend.data_calls();
    let again = migrator.migrate().await.unwrap();
    assert_eq!(again, MigrationOutcome::AlreadyDone);
    assert_eq!(backend.data_calls(), calls_before);
}

#[tokio::test]
async fn rerun_after_completion_leaves_store_identical() {
    let tmp = tempfile::tempdir().unwrap();
    let entries = [
        ("a", json!({"offset": 1})),
        ("b", json!({"offset": 2})),
        ("c", json!({"offset": 3})),
        ("__version", json!(3)),
    ];
    let path = seed_legacy(tmp.path(), &entries).await;
    let (backend, store) = remote(10).await;
    let markers = Arc::new(MemoryMarkerStore::new());

    let first = CheckpointMigrator::new("in", &path, store.clone(), markers.clone())
        .with_kind(MigrationKind::Billing);
    assert_eq!(
        first.migrate().await.unwrap(),
        MigrationOutcome::Completed { migrated: 3 }
    );
    let after_first = backend.records(COLLECTION);
    let keys: Vec<&str> = after_first.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b", "c"]);

    // A fresh migrator (new owner token) sees the completed marker.
    let second = CheckpointMigrator::new("in", &path, store.clone(), markers.clone())
        .with_kind(MigrationKind::Billing);
    assert_eq!(second.migrate().await.unwrap(), MigrationOutcome::AlreadyDone);
    assert_eq!(backend.records(COLLECTION), after_first);
}

#[tokio::test]
async fn concurrent_migrations_transfer_once() {
    let tmp = tempfile::tempdir().unwrap();
    let path = seed_legacy(tmp.path(), &[("obj1", json!(1)), ("obj2", json!(2))]).await;
    let (backend, store) = remote(2).await;
    backend.set_batch_delay(Duration::from_millis(100));
    let markers = Arc::new(MemoryMarkerStore::new());

    let a = CheckpointMigrator::new("in", &path, store.clone(), markers.clone());
    let b = CheckpointMigrator::new("in", &path, store.clone(), markers.clone());
    assert_ne!(a.token(), b.token());

    let (ra, rb) = tokio::join!(a.migrate(), b.migrate());

    let (ok, err) = match (ra, rb) {
        (Ok(ok), Err(err)) | (Err(err), Ok(ok)) => (ok, err),
        other => panic!("expected exactly one migration to run, got {other:?}"),
    };
    assert!(matches!(ok, MigrationOutcome::Completed { migrated: 2 }));
    assert!(matches!(err, MigrationError::InProgress { .. }));
    assert!(err.is_signal());
    // Chunk size is limit - 1, so two records take two calls.
    assert_eq!(backend.batch_calls(), vec![1, 1]);
}

/// Wraps a store and cancels a token after the first batch write.
struct CancelAfterFirstBatch {
    inner: Arc<RemoteCheckpointStore>,
    cancel: CancellationToken,
}

#[async_trait]
impl CheckpointStore for CancelAfterFirstBatch {
    fn name(&self) -> &str {
        "cancel-after-first"
    }

    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }

    async fn get(&self, key: &CheckpointKey) -> Result<Option<CheckpointRecord>, StoreError> {
        self.inner.get(key).await
    }

    async fn update(&self, record: CheckpointRecord) -> Result<(), StoreError> {
        self.inner.update(record).await
    }

    async fn batch_save(
        &self,
        records: Vec<CheckpointRecord>,
    ) -> Result<BatchSaveReport, StoreError> {
        let report = self.inner.batch_save(records).await;
        self.cancel.cancel();
        report
    }

    async fn delete(&self, key: &CheckpointKey) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn cancellation_stops_without_completing_and_resumes() {
    let tmp = tempfile::tempdir().unwrap();
    let entries: Vec<(String, serde_json::Value)> =
        (0..5).map(|i| (format!("obj{i}"), json!(i * 10))).collect();
    let borrowed: Vec<(&str, serde_json::Value)> =
        entries.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
    let path = seed_legacy(tmp.path(), &borrowed).await;
    let (backend, store) = remote(2).await;
    let markers = Arc::new(MemoryMarkerStore::new());

    let cancel = CancellationToken::new();
    let target = Arc::new(CancelAfterFirstBatch {
        inner: store.clone(),
        cancel: cancel.clone(),
    });
    let migrator = CheckpointMigrator::new("in", &path, target, markers.clone())
        .with_cancel(cancel);

    let err = migrator.migrate().await.unwrap_err();
    assert!(matches!(err, MigrationError::Stopped { migrated: 1, .. }));
    assert_eq!(migrator.phase(), MigrationPhase::Stopped);
    assert!(path.exists());
    assert!(matches!(
        markers.load("in").await.unwrap(),
        MigrationState::Migrating { .. }
    ));

    // The same owner resumes from the start of the intact file.
    let resumed = CheckpointMigrator::new("in", &path, store.clone(), markers.clone())
        .with_token(migrator.token());
    assert_eq!(
        resumed.migrate().await.unwrap(),
        MigrationOutcome::Completed { migrated: 5 }
    );
    assert_eq!(backend.records(COLLECTION).len(), 5);
    assert!(!path.exists());
}

#[tokio::test]
async fn missing_legacy_file_marks_migrated() {
    let tmp = tempfile::tempdir().unwrap();
    let (backend, store) = remote(5).await;
    let markers = Arc::new(MemoryMarkerStore::new());

    let absent = tmp.path().join("absent.ckpt");
    let migrator = CheckpointMigrator::new("in", absent, store, markers.clone());
    assert_eq!(
        migrator.migrate().await.unwrap(),
        MigrationOutcome::NothingToMigrate
    );
    assert!(markers.load("in").await.unwrap().is_migrated());
    assert_eq!(backend.data_calls(), 0);
}

#[tokio::test]
async fn failed_chunk_leaves_file_and_claim_in_place() {
    let tmp = tempfile::tempdir().unwrap();
    let path = seed_legacy(tmp.path(), &[("obj1", json!(1)), ("obj2", json!(2))]).await;
    let (backend, store) = remote(3).await;
    backend.reject_key("obj2");
    let markers = Arc::new(MemoryMarkerStore::new());

    let migrator = CheckpointMigrator::new("in", &path, store.clone(), markers.clone());
    let err = migrator.migrate().await.unwrap_err();
    assert!(matches!(err, MigrationError::Incomplete { failed: 1, .. }));
    assert!(!err.is_signal());
    assert_eq!(migrator.phase(), MigrationPhase::Failed);
    assert!(path.exists());
    assert!(!markers.load("in").await.unwrap().is_migrated());

    // Reopening the untouched file still yields both entries.
    let legacy = FileCheckpointStore::open(&path, "/MK/").unwrap();
    assert_eq!(legacy.len(), 2);
}
