//! Shared key-value checkpoint service backends.

mod http;
mod memory;

pub use http::HttpKvBackend;
pub use memory::MemoryKvBackend;

use async_trait::async_trait;

use cloudtap_core::CheckpointRecord;

use crate::error::StoreError;

/// A KV-store-like service holding checkpoint collections.
///
/// Implementations map their failures onto [`StoreError::Transient`]
/// (network, throttling, 5xx) or [`StoreError::Permanent`] (bad request,
/// missing record on delete) so the retry policy can tell them apart.
#[async_trait]
pub trait KvBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Maximum documents accepted by one `batch_save` call (the service's limits endpoint).
    async fn max_batch_size(&self) -> Result<usize, StoreError>;

    async fn get(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<CheckpointRecord>, StoreError>;

    async fn upsert(&self, collection: &str, record: &CheckpointRecord) -> Result<(), StoreError>;

    /// Upsert `records`, returning the keys that were saved.
    async fn batch_save(
        &self,
        collection: &str,
        records: &[CheckpointRecord],
    ) -> Result<Vec<String>, StoreError>;

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StoreError>;
}
