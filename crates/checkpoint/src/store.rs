//! The checkpoint store contract shared by both backends.

use std::sync::Arc;

use async_trait::async_trait;

use cloudtap_core::{CheckpointKey, CheckpointRecord};

use crate::error::StoreError;

/// A record that a batch save could not persist, with the reason.
#[derive(Debug)]
pub struct FailedWrite {
    pub record: CheckpointRecord,
    pub error: StoreError,
}

/// Result of a [`CheckpointStore::batch_save`] call.
///
/// Batch saves are atomic per item, not per set: some records may land while
/// others fail. Callers retry only `failed`.
#[derive(Debug, Default)]
pub struct BatchSaveReport {
    /// Number of records persisted.
    pub saved: usize,
    /// Records that were not persisted.
    pub failed: Vec<FailedWrite>,
    /// Number of backend calls issued.
    pub requests: usize,
}

impl BatchSaveReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Take the records that still need writing.
    pub fn into_failed_records(self) -> Vec<CheckpointRecord> {
        self.failed.into_iter().map(|f| f.record).collect()
    }

    pub(crate) fn merge(&mut self, other: BatchSaveReport) {
        self.saved += other.saved;
        self.failed.extend(other.failed);
        self.requests += other.requests;
    }
}

/// Durable key → record map.
///
/// Shared read-mostly: many dispatcher workers call [`get`](Self::get)
/// concurrently while writes are funnelled through the single collector.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// Maximum number of records one backend write call accepts.
    fn max_batch_size(&self) -> usize;

    /// Look up a record. `Ok(None)` when the key has never been written.
    async fn get(&self, key: &CheckpointKey) -> Result<Option<CheckpointRecord>, StoreError>;

    /// Upsert a single record. Writing the same record twice is a no-op in effect.
    async fn update(&self, record: CheckpointRecord) -> Result<(), StoreError>;

    /// Upsert many records, chunked so no backend call exceeds
    /// [`max_batch_size`](Self::max_batch_size).
    async fn batch_save(
        &self,
        records: Vec<CheckpointRecord>,
    ) -> Result<BatchSaveReport, StoreError>;

    async fn delete(&self, key: &CheckpointKey) -> Result<(), StoreError>;

    /// Release resources. Idempotent.
    async fn close(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn max_batch_size(&self) -> usize {
        (**self).max_batch_size()
    }

    async fn get(&self, key: &CheckpointKey) -> Result<Option<CheckpointRecord>, StoreError> {
        (**self).get(key).await
    }

    async fn update(&self, record: CheckpointRecord) -> Result<(), StoreError> {
        (**self).update(record).await
    }

    async fn batch_save(
        &self,
        records: Vec<CheckpointRecord>,
    ) -> Result<BatchSaveReport, StoreError> {
        (**self).batch_save(records).await
    }

    async fn delete(&self, key: &CheckpointKey) -> Result<(), StoreError> {
        (**self).delete(key).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        (**self).close().await
    }
}
