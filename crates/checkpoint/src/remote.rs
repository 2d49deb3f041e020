//! Shared checkpoint store backed by a KV service.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use cloudtap_core::{CheckpointKey, CheckpointRecord};

use crate::error::StoreError;
use crate::kv::KvBackend;
use crate::retry::RetryPolicy;
use crate::store::{BatchSaveReport, CheckpointStore, FailedWrite};

/// [`CheckpointStore`] over a shared [`KvBackend`] collection.
///
/// Every backend call runs under the store's [`RetryPolicy`]. The backend's
/// batch limit is fetched once in [`connect`](Self::connect) and cached.
pub struct RemoteCheckpointStore {
    backend: Arc<dyn KvBackend>,
    collection: String,
    retry: RetryPolicy,
    max_batch: usize,
    closed: AtomicBool,
}

impl RemoteCheckpointStore {
    /// Connect to `collection`, querying the backend's batch limit.
    pub async fn connect(
        backend: Arc<dyn KvBackend>,
        collection: impl Into<String>,
        retry: RetryPolicy,
    ) -> Result<Self, StoreError> {
        let collection = collection.into();
        let max_batch = {
            let backend = &backend;
            retry
                .run("limits", move || async move { backend.max_batch_size().await })
                .await?
        };
        info!(
            backend = backend.name(),
            collection = %collection,
            max_batch,
            "connected remote checkpoint store"
        );
        Ok(Self {
            backend,
            collection,
            retry,
            max_batch: max_batch.max(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Write one chunk (≤ `max_batch` records) under the retry policy.
    async fn save_chunk(&self, chunk: &[CheckpointRecord]) -> BatchSaveReport {
        let backend = &self.backend;
        let collection = self.collection.as_str();
        let result = self
            .retry
            .run("batch_save", move || async move {
                backend.batch_save(collection, chunk).await
            })
            .await;

        match result {
            Ok(saved_keys) => {
                let saved: HashSet<String> = saved_keys.into_iter().collect();
                let mut report = BatchSaveReport {
                    requests: 1,
                    ..Default::default()
                };
                for record in chunk {
                    if saved.contains(record.key.as_str()) {
                        report.saved += 1;
                    } else {
                        report.failed.push(FailedWrite {
                            record: record.clone(),
                            error: StoreError::Permanent(format!(
                                "backend did not acknowledge key '{}'",
                                record.key
                            )),
                        });
                    }
                }
                report
            }
            Err(e) => {
                warn!(
                    collection = %self.collection,
                    records = chunk.len(),
                    error = %e,
                    "checkpoint batch chunk failed"
                );
                let message = e.to_string();
                let retryable = e.is_retryable();
                BatchSaveReport {
                    saved: 0,
                    requests: 1,
                    failed: chunk
                        .iter()
                        .map(|record| FailedWrite {
                            record: record.clone(),
                            error: if retryable {
                                StoreError::Transient(message.clone())
                            } else {
                                StoreError::Permanent(message.clone())
                            },
                        })
                        .collect(),
                }
            }
        }
    }
}

#[async_trait]
impl CheckpointStore for RemoteCheckpointStore {
    fn name(&self) -> &str {
        "remote"
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
    }

    async fn get(&self, key: &CheckpointKey) -> Result<Option<CheckpointRecord>, StoreError> {
        self.ensure_open()?;
        key.validate()?;
        let backend = &self.backend;
        let collection = self.collection.as_str();
        let raw = key.as_str();
        self.retry
            .run("get", move || async move { backend.get(collection, raw).await })
            .await
    }

    async fn update(&self, record: CheckpointRecord) -> Result<(), StoreError> {
        self.ensure_open()?;
        record.key.validate()?;
        let backend = &self.backend;
        let collection = self.collection.as_str();
        let record = &record;
        self.retry
            .run("update", move || async move { backend.upsert(collection, record).await })
            .await
    }

    async fn batch_save(
        &self,
        records: Vec<CheckpointRecord>,
    ) -> Result<BatchSaveReport, StoreError> {
        self.ensure_open()?;
        let mut report = BatchSaveReport::default();
        let mut valid = Vec::with_capacity(records.len());
        for record in records {
            match record.key.validate() {
                Ok(()) => valid.push(record),
                Err(e) => report.failed.push(FailedWrite {
                    record,
                    error: e.into(),
                }),
            }
        }

        for chunk in valid.chunks(self.max_batch) {
            let chunk_report = self.save_chunk(chunk).await;
            report.merge(chunk_report);
        }

        debug!(
            collection = %self.collection,
            saved = report.saved,
            failed = report.failed.len(),
            requests = report.requests,
            "checkpoint batch saved"
        );
        Ok(report)
    }

    async fn delete(&self, key: &CheckpointKey) -> Result<(), StoreError> {
        self.ensure_open()?;
        let backend = &self.backend;
        let collection = self.collection.as_str();
        let raw = key.as_str();
        self.retry
            .run("delete", move || async move { backend.delete(collection, raw).await })
            .await
    }

    async fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(collection = %self.collection, "remote checkpoint store closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvBackend;
    use serde_json::json;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_factor: 2.0,
        }
    }

    fn records(n: usize) -> Vec<CheckpointRecord> {
        (0..n)
            .map(|i| CheckpointRecord::new(format!("k{i}"), json!(i)))
            .collect()
    }

    #[tokio::test]
    async fn batch_save_chunks_at_backend_limit() {
        let backend = Arc::new(MemoryKvBackend::new(4));
        let store = RemoteCheckpointStore::connect(backend.clone(), "ckpt", fast_retry())
            .await
            .unwrap();
        assert_eq!(store.max_batch_size(), 4);

        let report = store.batch_save(records(10)).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.saved, 10);
        assert_eq!(report.requests, 3);
        assert_eq!(backend.batch_calls(), vec![4, 4, 2]);
        assert_eq!(backend.records("ckpt").len(), 10);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let backend = Arc::new(MemoryKvBackend::new(10));
        let store = RemoteCheckpointStore::connect(backend.clone(), "ckpt", fast_retry())
            .await
            .unwrap();
        backend.fail_next(2);
        store.update(CheckpointRecord::new("a", json!(1))).await.unwrap();
        assert_eq!(backend.data_calls(), 3);
        assert_eq!(
            store.get(&"a".into()).await.unwrap().unwrap().payload,
            json!(1)
        );
    }

    #[tokio::test]
    async fn exhausted_chunk_is_reported_as_failed() {
        let backend = Arc::new(MemoryKvBackend::new(2));
        let store = RemoteCheckpointStore::connect(backend.clone(), "ckpt", fast_retry())
            .await
            .unwrap();
        // First chunk exhausts all three attempts, second succeeds.
        backend.fail_next(3);
        let report = store.batch_save(records(4)).await.unwrap();
        assert_eq!(report.saved, 2);
        assert_eq!(report.failed.len(), 2);
        assert!(report.failed.iter().all(|f| f.error.is_retryable()));
        let keys: Vec<String> = report
            .into_failed_records()
            .into_iter()
            .map(|r| r.key.to_string())
            .collect();
        assert_eq!(keys, vec!["k0", "k1"]);
    }

    #[tokio::test]
    async fn unacknowledged_keys_are_partial_failures() {
        let backend = Arc::new(MemoryKvBackend::new(10));
        backend.reject_key("k1");
        let store = RemoteCheckpointStore::connect(backend.clone(), "ckpt", fast_retry())
            .await
            .unwrap();
        let report = store.batch_save(records(3)).await.unwrap();
        assert_eq!(report.saved, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].record.key.as_str(), "k1");
    }

    #[tokio::test]
    async fn invalid_keys_fail_without_backend_calls() {
        let backend = Arc::new(MemoryKvBackend::new(10));
        let store = RemoteCheckpointStore::connect(backend.clone(), "ckpt", fast_retry())
            .await
            .unwrap();
        let err = store.get(&CheckpointKey::new("")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
        assert_eq!(backend.data_calls(), 0);
    }

    #[tokio::test]
    async fn delete_missing_is_not_retried() {
        let backend = Arc::new(MemoryKvBackend::new(10));
        let store = RemoteCheckpointStore::connect(backend.clone(), "ckpt", fast_retry())
            .await
            .unwrap();
        let err = store.delete(&"nope".into()).await.unwrap_err();
        assert!(matches!(err, StoreError::Permanent(_)));
        assert_eq!(backend.data_calls(), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let backend = Arc::new(MemoryKvBackend::new(10));
        let store = RemoteCheckpointStore::connect(backend, "ckpt", fast_retry())
            .await
            .unwrap();
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(
            store.get(&"a".into()).await.unwrap_err(),
            StoreError::Closed
        ));
    }
}
