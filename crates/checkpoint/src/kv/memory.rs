use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use cloudtap_core::CheckpointRecord;

use super::KvBackend;
use crate::error::StoreError;

/// In-process KV backend.
///
/// Used for local runs without a shared service and as the test double for
/// the remote store: it records batch sizes, counts calls and can inject
/// transient failures or per-key rejections.
pub struct MemoryKvBackend {
    max_batch: usize,
    collections: Mutex<HashMap<String, BTreeMap<String, CheckpointRecord>>>,
    batch_calls: Mutex<Vec<usize>>,
    data_calls: AtomicUsize,
    fail_next: AtomicUsize,
    rejected_keys: Mutex<HashSet<String>>,
    batch_delay: Mutex<Option<Duration>>,
}

impl MemoryKvBackend {
    pub fn new(max_batch: usize) -> Self {
        Self {
            max_batch: max_batch.max(1),
            collections: Mutex::new(HashMap::new()),
            batch_calls: Mutex::new(Vec::new()),
            data_calls: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            rejected_keys: Mutex::new(HashSet::new()),
            batch_delay: Mutex::new(None),
        }
    }

    /// All records in `collection`, ordered by key.
    pub fn records(&self, collection: &str) -> Vec<CheckpointRecord> {
        self.collections
            .lock()
            .unwrap()
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Sizes of every `batch_save` call received, in order.
    pub fn batch_calls(&self) -> Vec<usize> {
        self.batch_calls.lock().unwrap().clone()
    }

    /// Number of get/upsert/batch_save/delete calls received.
    pub fn data_calls(&self) -> usize {
        self.data_calls.load(Ordering::SeqCst)
    }

    /// Fail the next `n` data calls with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Leave `key` out of every `batch_save` result.
    pub fn reject_key(&self, key: &str) {
        self.rejected_keys.lock().unwrap().insert(key.to_string());
    }

    /// Delay every `batch_save` call by `delay`.
    pub fn set_batch_delay(&self, delay: Duration) {
        *self.batch_delay.lock().unwrap() = Some(delay);
    }

    fn enter(&self) -> Result<(), StoreError> {
        self.data_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Transient("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvBackend for MemoryKvBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn max_batch_size(&self) -> Result<usize, StoreError> {
        Ok(self.max_batch)
    }

    async fn get(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<CheckpointRecord>, StoreError> {
        self.enter()?;
        Ok(self
            .collections
            .lock()
            .unwrap()
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned())
    }

    async fn upsert(&self, collection: &str, record: &CheckpointRecord) -> Result<(), StoreError> {
        self.enter()?;
        self.collections
            .lock()
            .unwrap()
            .entry(collection.to_string())
            .or_default()
            .insert(record.key.as_str().to_string(), record.clone());
        Ok(())
    }

    async fn batch_save(
        &self,
        collection: &str,
        records: &[CheckpointRecord],
    ) -> Result<Vec<String>, StoreError> {
        let delay = *self.batch_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.enter()?;
        if records.len() > self.max_batch {
            return Err(StoreError::Permanent(format!(
                "batch of {} exceeds limit {}",
                records.len(),
                self.max_batch
            )));
        }
        self.batch_calls.lock().unwrap().push(records.len());

        let rejected = self.rejected_keys.lock().unwrap().clone();
        let mut collections = self.collections.lock().unwrap();
        let coll = collections.entry(collection.to_string()).or_default();
        let mut saved = Vec::with_capacity(records.len());
        for record in records {
            let key = record.key.as_str();
            if rejected.contains(key) {
                continue;
            }
            coll.insert(key.to_string(), record.clone());
            saved.push(key.to_string());
        }
        Ok(saved)
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        self.enter()?;
        let removed = self
            .collections
            .lock()
            .unwrap()
            .get_mut(collection)
            .and_then(|c| c.remove(key));
        match removed {
            Some(_) => Ok(()),
            None => Err(StoreError::Permanent(format!("key '{}' not found", key))),
        }
    }
}
