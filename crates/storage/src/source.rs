//! The object source consumed by the dispatcher: list a prefix, fetch a range.

use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{join_prefix, StorageBackend};
use crate::error::SourceError;

/// One listed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    /// Full object path within the store.
    pub location: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub etag: Option<String>,
}

#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Account identity (bucket, storage account) for checkpoint keys.
    fn account(&self) -> &str;

    /// All objects under `prefix`, every page drained, ordered by location.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectDescriptor>, SourceError>;

    /// Bytes `range` of an object.
    async fn fetch(
        &self,
        object: &ObjectDescriptor,
        range: Range<u64>,
    ) -> Result<Bytes, SourceError>;
}

#[async_trait]
impl<T: ObjectSource + ?Sized> ObjectSource for Arc<T> {
    fn account(&self) -> &str {
        (**self).account()
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectDescriptor>, SourceError> {
        (**self).list(prefix).await
    }

    async fn fetch(
        &self,
        object: &ObjectDescriptor,
        range: Range<u64>,
    ) -> Result<Bytes, SourceError> {
        (**self).fetch(object, range).await
    }
}

/// [`ObjectSource`] over any [`StorageBackend`].
pub struct ObjectStoreSource {
    backend: StorageBackend,
    account: String,
}

impl ObjectStoreSource {
    pub fn new(backend: StorageBackend) -> Self {
        let account = backend.account();
        Self { backend, account }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = account.into();
        self
    }

    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }
}

#[async_trait]
impl ObjectSource for ObjectStoreSource {
    fn account(&self) -> &str {
        &self.account
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectDescriptor>, SourceError> {
        let full = join_prefix(self.backend.prefix(), prefix);
        let prefix_path = ObjectPath::from(full.as_str());
        let list_path = if full.is_empty() { None } else { Some(&prefix_path) };

        let mut stream = self.backend.store().list(list_path);
        let mut objects = Vec::new();
        while let Some(meta) = stream.try_next().await? {
            objects.push(ObjectDescriptor {
                location: meta.location.to_string(),
                size: meta.size as u64,
                last_modified: meta.last_modified,
                etag: meta.e_tag,
            });
        }
        objects.sort_by(|a, b| a.location.cmp(&b.location));

        debug!(prefix = %full, count = objects.len(), "listed objects");
        Ok(objects)
    }

    async fn fetch(
        &self,
        object: &ObjectDescriptor,
        range: Range<u64>,
    ) -> Result<Bytes, SourceError> {
        if range.start >= range.end {
            return Ok(Bytes::new());
        }
        let path = ObjectPath::from(object.location.as_str());
        let bytes = self
            .backend
            .store()
            .get_range(&path, range.start as usize..range.end as usize)
            .await?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::PutPayload;

    async fn seeded() -> ObjectStoreSource {
        let backend = StorageBackend::memory();
        for (path, body) in [
            ("logs/b.log", "bbbb\n"),
            ("logs/a.log", "a1\na2\n"),
            ("other/c.log", "c\n"),
        ] {
            backend
                .store()
                .put(&ObjectPath::from(path), PutPayload::from(body.as_bytes().to_vec()))
                .await
                .unwrap();
        }
        ObjectStoreSource::new(backend)
    }

    #[tokio::test]
    async fn list_is_prefix_scoped_and_sorted() {
        let source = seeded().await;
        let objects = source.list("logs").await.unwrap();
        let names: Vec<&str> = objects.iter().map(|o| o.location.as_str()).collect();
        assert_eq!(names, vec!["logs/a.log", "logs/b.log"]);
        assert_eq!(objects[0].size, 6);
        assert_eq!(source.list("").await.unwrap().len(), 3);
        assert_eq!(source.account(), "memory");
    }

    #[tokio::test]
    async fn fetch_reads_ranges() {
        let source = seeded().await;
        let objects = source.list("logs").await.unwrap();
        let a = &objects[0];
        let bytes = source.fetch(a, 3..6).await.unwrap();
        assert_eq!(&bytes[..], b"a2\n");
        assert!(source.fetch(a, 6..6).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_missing_object_is_not_found() {
        let source = seeded().await;
        let ghost = ObjectDescriptor {
            location: "logs/ghost.log".into(),
            size: 10,
            last_modified: Utc::now(),
            etag: None,
        };
        let err = source.fetch(&ghost, 0..10).await.unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
    }
}
